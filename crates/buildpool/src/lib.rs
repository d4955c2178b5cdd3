// buildpool: multi-threaded file-processing worker pool for the content-build engine.

pub mod context;
pub mod error;
pub mod file;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod value;
pub mod worker;

mod channel;
mod executor;
mod protocol;

pub use context::{default_concurrency, BuildContext};
pub use error::{reconstruct, ErrorRecord, ErrorSink, PoolError};
pub use file::{normalize_output, ChangeKind, ChangedFile, Contents, File};
pub use logging::{BuildLogger, LogLevel, LogMessage, RunLogger};
pub use pool::{ModuleRef, ProcessorProxy, WorkerPool};
pub use registry::{ModuleExport, ProcessorFn, ProcessorOutput};
pub use value::Value;
pub use worker::FileStream;
