//! The plugin module registry and the processor contract.
//!
//! Plugin modules are registered by module id, either scoped to a project
//! directory ([`register_in`], the equivalent of a module that lives next to
//! the project) or process-globally ([`register`], the equivalent of an
//! installed package). Workers resolve a module id against the project
//! directory first and fall back to the global registry.
//!
//! What a module provides is its [`ModuleExport`]:
//!
//! - a [`ProcessorFn`], ready to process files;
//! - a factory, invoked with the import data to build the processor;
//! - a setup hook, invoked once per worker for its side effects;
//! - or a plain [`Value`], which cannot process files and is reported as
//!   such when a processor import is attempted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::context::BuildContext;
use crate::error::{ErrorRecord, PoolError};
use crate::file::File;
use crate::value::Value;

// ── Processor contract ────────────────────────────────────────────────────────

/// What one processor invocation produces: zero or more output files.
pub enum ProcessorOutput {
    /// No output for this input.
    None,
    One(File),
    Many(Vec<File>),
    /// Lazily produced outputs. The iterator may block between items; each
    /// file is streamed back as soon as it is yielded.
    Stream(Box<dyn Iterator<Item = Result<File, ErrorRecord>> + Send>),
}

impl ProcessorOutput {
    pub(crate) fn into_output_iter(
        self,
    ) -> Box<dyn Iterator<Item = Result<File, ErrorRecord>> + Send> {
        match self {
            ProcessorOutput::None => Box::new(std::iter::empty()),
            ProcessorOutput::One(file) => Box::new(std::iter::once(Ok(file))),
            ProcessorOutput::Many(files) => Box::new(files.into_iter().map(Ok)),
            ProcessorOutput::Stream(iter) => iter,
        }
    }
}

impl fmt::Debug for ProcessorOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorOutput::None => f.write_str("ProcessorOutput::None"),
            ProcessorOutput::One(file) => write!(f, "ProcessorOutput::One({})", file.path),
            ProcessorOutput::Many(files) => {
                write!(f, "ProcessorOutput::Many({} files)", files.len())
            }
            ProcessorOutput::Stream(_) => f.write_str("ProcessorOutput::Stream(..)"),
        }
    }
}

impl From<File> for ProcessorOutput {
    fn from(file: File) -> ProcessorOutput {
        ProcessorOutput::One(file)
    }
}

impl From<Vec<File>> for ProcessorOutput {
    fn from(files: Vec<File>) -> ProcessorOutput {
        ProcessorOutput::Many(files)
    }
}

impl From<Option<File>> for ProcessorOutput {
    fn from(file: Option<File>) -> ProcessorOutput {
        match file {
            Some(file) => ProcessorOutput::One(file),
            None => ProcessorOutput::None,
        }
    }
}

type ProcessorFunc =
    Arc<dyn Fn(File, &BuildContext) -> Result<ProcessorOutput, ErrorRecord> + Send + Sync>;
type FactoryFunc =
    Arc<dyn Fn(Option<Value>) -> Result<ProcessorFn, ErrorRecord> + Send + Sync>;
type SetupFunc = Arc<dyn Fn(Option<Value>) -> Result<(), ErrorRecord> + Send + Sync>;

/// A named file processor: `(file, run)` to zero or more output files.
#[derive(Clone)]
pub struct ProcessorFn {
    name: String,
    func: ProcessorFunc,
}

impl ProcessorFn {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(File, &BuildContext) -> Result<ProcessorOutput, ErrorRecord>
            + Send
            + Sync
            + 'static,
    ) -> ProcessorFn {
        ProcessorFn {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// A processor with no declared name.
    pub fn anonymous(
        func: impl Fn(File, &BuildContext) -> Result<ProcessorOutput, ErrorRecord>
            + Send
            + Sync
            + 'static,
    ) -> ProcessorFn {
        ProcessorFn::new("", func)
    }

    /// The declared display name (may be empty).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(
        &self,
        file: File,
        run: &BuildContext,
    ) -> Result<ProcessorOutput, ErrorRecord> {
        let func = self.func.as_ref();
        func(file, run)
    }
}

impl fmt::Debug for ProcessorFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessorFn({:?})", self.name)
    }
}

/// The default export of a registered plugin module.
#[derive(Clone)]
pub enum ModuleExport {
    Processor(ProcessorFn),
    Factory(FactoryFunc),
    Setup(SetupFunc),
    Value(Value),
}

impl ModuleExport {
    /// A module exporting a ready processor.
    pub fn processor(
        name: impl Into<String>,
        func: impl Fn(File, &BuildContext) -> Result<ProcessorOutput, ErrorRecord>
            + Send
            + Sync
            + 'static,
    ) -> ModuleExport {
        ModuleExport::Processor(ProcessorFn::new(name, func))
    }

    /// A module exporting a factory: invoked with the import data, yields
    /// the processor.
    pub fn factory(
        func: impl Fn(Option<Value>) -> Result<ProcessorFn, ErrorRecord> + Send + Sync + 'static,
    ) -> ModuleExport {
        ModuleExport::Factory(Arc::new(func))
    }

    /// A module exporting a setup hook, run once per worker at import time.
    pub fn setup(
        func: impl Fn(Option<Value>) -> Result<(), ErrorRecord> + Send + Sync + 'static,
    ) -> ModuleExport {
        ModuleExport::Setup(Arc::new(func))
    }

    /// A module whose export is plain data.
    pub fn value(value: impl Into<Value>) -> ModuleExport {
        ModuleExport::Value(value.into())
    }
}

impl fmt::Debug for ModuleExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleExport::Processor(p) => write!(f, "ModuleExport::Processor({:?})", p.name),
            ModuleExport::Factory(_) => f.write_str("ModuleExport::Factory(..)"),
            ModuleExport::Setup(_) => f.write_str("ModuleExport::Setup(..)"),
            ModuleExport::Value(v) => write!(f, "ModuleExport::Value({v})"),
        }
    }
}

// ── Registries ────────────────────────────────────────────────────────────────

fn global_registry() -> &'static RwLock<HashMap<String, ModuleExport>> {
    static GLOBAL: OnceLock<RwLock<HashMap<String, ModuleExport>>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(HashMap::new()))
}

fn scoped_registry() -> &'static RwLock<HashMap<(String, String), ModuleExport>> {
    static SCOPED: OnceLock<RwLock<HashMap<(String, String), ModuleExport>>> = OnceLock::new();
    SCOPED.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers a module process-globally (an "installed" module).
pub fn register(module_id: impl Into<String>, export: ModuleExport) {
    global_registry()
        .write()
        .expect("module registry poisoned")
        .insert(module_id.into(), export);
}

/// Registers a module scoped to a project directory. Scoped modules shadow
/// global ones for builds running in that directory.
pub fn register_in(cwd: impl Into<String>, module_id: impl Into<String>, export: ModuleExport) {
    scoped_registry()
        .write()
        .expect("module registry poisoned")
        .insert((cwd.into(), module_id.into()), export);
}

/// Removes every registered module. Intended for test isolation.
pub fn clear() {
    global_registry()
        .write()
        .expect("module registry poisoned")
        .clear();
    scoped_registry()
        .write()
        .expect("module registry poisoned")
        .clear();
}

/// Resolves a module id: project-scoped entry first, then global.
pub(crate) fn resolve(module_id: &str, cwd: &str) -> Option<ModuleExport> {
    if let Some(export) = scoped_registry()
        .read()
        .expect("module registry poisoned")
        .get(&(cwd.to_string(), module_id.to_string()))
    {
        return Some(export.clone());
    }
    global_registry()
        .read()
        .expect("module registry poisoned")
        .get(module_id)
        .cloned()
}

// ── Import semantics ──────────────────────────────────────────────────────────

fn resolve_or_fail(
    worker_id: usize,
    module_id: &str,
    cwd: &str,
) -> Result<ModuleExport, PoolError> {
    resolve(module_id, cwd).ok_or_else(|| PoolError::ModuleImportFailed {
        module_id: module_id.to_string(),
        source: Box::new(PoolError::ModuleNotFound {
            worker_id,
            module_id: module_id.to_string(),
        }),
    })
}

/// Imports a module as a file processor.
///
/// A plain processor export registers directly; a factory is invoked with
/// the import data (or `None`) and must yield the processor. Everything
/// else fails with `InvalidProcessor` describing what was actually
/// exported.
pub(crate) fn import_file_processor(
    worker_id: usize,
    module_id: &str,
    cwd: &str,
    data: Option<Value>,
) -> Result<ProcessorFn, PoolError> {
    match resolve_or_fail(worker_id, module_id, cwd)? {
        ModuleExport::Processor(processor) => {
            if data.is_some() {
                return Err(PoolError::InvalidProcessor(format!(
                    "The module \"{module_id}\" does not accept import data"
                )));
            }
            Ok(processor)
        }
        ModuleExport::Factory(factory) => {
            factory.as_ref()(data).map_err(crate::error::reconstruct)
        }
        ModuleExport::Setup(_) => Err(PoolError::InvalidProcessor(format!(
            "The module \"{module_id}\" exported a setup hook, not a file processor"
        ))),
        ModuleExport::Value(value) => Err(PoolError::InvalidProcessor(format!(
            "The module exported {value}"
        ))),
    }
}

/// Imports a module for its side effects: setup hooks and factories are
/// invoked with the import data, other exports are no-ops.
pub(crate) fn import_module(
    worker_id: usize,
    module_id: &str,
    cwd: &str,
    data: Option<Value>,
) -> Result<(), PoolError> {
    match resolve_or_fail(worker_id, module_id, cwd)? {
        ModuleExport::Setup(setup) => setup.as_ref()(data).map_err(crate::error::reconstruct),
        ModuleExport::Factory(factory) => factory.as_ref()(data)
            .map(|_| ())
            .map_err(crate::error::reconstruct),
        ModuleExport::Processor(_) | ModuleExport::Value(_) => Ok(()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
