// Pool-level behavior: round-robin dispatch, broadcast imports, factory
// data, and disposal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use buildpool::{
    registry, BuildContext, BuildLogger, File, LogLevel, LogMessage, ModuleExport, PoolError,
    ProcessorFn, ProcessorOutput, Value, WorkerPool,
};

struct NullLogger;

impl BuildLogger for NullLogger {
    fn log(&self, _: LogLevel, _: &LogMessage, _: Option<&Value>) {}
}

fn context(cwd: &str, concurrency: usize) -> BuildContext {
    BuildContext::new(cwd, Arc::new(NullLogger)).with_concurrency(concurrency)
}

/// Over k * N sequential calls, each of the N workers gets exactly k.
#[test]
fn test_round_robin_distributes_evenly() {
    registry::register(
        "pool-thread-probe",
        ModuleExport::processor("thread-probe", |mut file, _run| {
            let thread = std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string();
            file.metadata = Value::map([("thread", Value::str(thread))]);
            Ok(ProcessorOutput::One(file))
        }),
    );

    let ctx = context("/site", 3);
    let pool = WorkerPool::new(&ctx, Arc::new(|_, _| {})).expect("pool");
    let processor = pool
        .import_file_processor("pool-thread-probe")
        .expect("import");

    let mut seen: HashMap<String, usize> = HashMap::new();
    for i in 0..9 {
        let mut file = File::new(format!("f{i}.md"));
        let outputs: Vec<File> = processor
            .process(&mut file, &ctx)
            .expect("process")
            .collect::<Result<_, _>>()
            .expect("stream");
        let thread = outputs[0]
            .metadata
            .get("thread")
            .and_then(Value::as_str)
            .expect("thread name recorded")
            .to_string();
        *seen.entry(thread).or_default() += 1;
    }

    assert_eq!(seen.len(), 3, "all three workers must be used: {seen:?}");
    for (thread, count) in &seen {
        assert_eq!(*count, 3, "worker {thread} must get exactly 3 of 9 calls");
    }

    pool.dispose();
}

/// A factory module receives the import data and bakes it into the
/// processor it returns.
#[test]
fn test_factory_with_data() {
    registry::register(
        "pool-stamper",
        ModuleExport::factory(|data| {
            let stamp = data
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(ProcessorFn::new("stamper", move |mut file, _run| {
                file.set_text(stamp.clone());
                Ok(ProcessorOutput::One(file))
            }))
        }),
    );

    let ctx = context("/site", 2);
    let pool = WorkerPool::new(&ctx, Arc::new(|_, _| {})).expect("pool");
    let processor = pool
        .import_file_processor(
            buildpool::ModuleRef::new("pool-stamper").with_data("hello"),
        )
        .expect("import");
    assert_eq!(processor.name(), "stamper");

    let mut file = File::new("file.txt");
    let outputs: Vec<File> = processor
        .process(&mut file, &ctx)
        .expect("process")
        .collect::<Result<_, _>>()
        .expect("stream");
    assert_eq!(outputs[0].text(), "hello");

    pool.dispose();
}

/// `import_module` runs the setup hook on every worker exactly once.
#[test]
fn test_import_module_runs_on_every_worker() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    registry::register(
        "pool-global-hook",
        ModuleExport::setup(|data| {
            assert_eq!(data, Some(Value::str("boot")));
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let ctx = context("/site", 4);
    let pool = WorkerPool::new(&ctx, Arc::new(|_, _| {})).expect("pool");
    pool.import_module(buildpool::ModuleRef::new("pool-global-hook").with_data("boot"))
        .expect("import");

    assert_eq!(
        CALLS.load(Ordering::SeqCst),
        4,
        "the hook must run once per worker"
    );
    pool.dispose();
}

/// Disposal terminates the workers, empties the pool, and stays settled.
#[test]
fn test_dispose_idempotent_end_to_end() {
    registry::register(
        "pool-dispose-noop",
        ModuleExport::processor("noop", |file, _run| Ok(ProcessorOutput::One(file))),
    );

    let ctx = context("/site", 2);
    let pool = WorkerPool::new(&ctx, Arc::new(|_, _| {})).expect("pool");
    let processor = pool
        .import_file_processor("pool-dispose-noop")
        .expect("import");

    pool.dispose();
    pool.dispose();
    assert!(pool.is_disposed());
    assert_eq!(pool.size(), 0);

    // Both the pool and any surviving proxy refuse further work.
    assert!(matches!(
        pool.import_file_processor("pool-dispose-noop"),
        Err(PoolError::PoolDisposed)
    ));
    let mut file = File::new("x.md");
    assert!(matches!(
        processor.process(&mut file, &ctx),
        Err(PoolError::PoolDisposed)
    ));
}

/// An anonymous processor reports an empty proxy name.
#[test]
fn test_anonymous_processor_has_empty_name() {
    registry::register(
        "pool-anonymous",
        ModuleExport::Processor(ProcessorFn::anonymous(|file, _run| {
            Ok(ProcessorOutput::One(file))
        })),
    );

    let ctx = context("/site", 1);
    let pool = WorkerPool::new(&ctx, Arc::new(|_, _| {})).expect("pool");
    let processor = pool.import_file_processor("pool-anonymous").expect("import");
    assert_eq!(processor.name(), "");
    pool.dispose();
}

/// A processor yielding nothing completes with an empty stream.
#[test]
fn test_processor_may_yield_nothing() {
    registry::register(
        "pool-silent",
        ModuleExport::processor("silent", |_file, _run| Ok(ProcessorOutput::None)),
    );

    let ctx = context("/site", 1);
    let pool = WorkerPool::new(&ctx, Arc::new(|_, _| {})).expect("pool");
    let processor = pool.import_file_processor("pool-silent").expect("import");

    let mut file = File::new("x.md");
    let outputs: Vec<File> = processor
        .process(&mut file, &ctx)
        .expect("process")
        .collect::<Result<_, _>>()
        .expect("stream");
    assert!(outputs.is_empty());
    pool.dispose();
}
