use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::{
    Globals, LazyInitializer, ScriptError, ScriptValue,
    ast::{self, Stmt},
    eval::Activation,
};

static NEXT_COMPILATION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub(crate) enum ConstantEntry {
    Ready(ScriptValue),
    Lazy(LazyInitializer),
}

/// Output of [`generate`](super::generate): the source of one method plus
/// the constant table its `$C[i]` and `$F.C(i)` references index.
#[derive(Debug)]
pub struct Compilation {
    id: u64,
    parameters: Vec<String>,
    source: String,
    body: Vec<Stmt>,
    constants: Mutex<Vec<ConstantEntry>>,
}

impl Compilation {
    pub(crate) fn with_id(
        id: u64,
        parameters: Vec<String>,
        body: Vec<Stmt>,
        constants: Vec<ConstantEntry>,
    ) -> Self {
        Self {
            id,
            parameters,
            source: ast::render(&body),
            body,
            constants: Mutex::new(constants),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name under which generated code refers to this unit.
    pub fn global_name(&self) -> String {
        global_name(self.id)
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn constant_count(&self) -> usize {
        self.constants.lock().len()
    }

    /// Constant `index`, running its initializer on first access.
    pub fn resolve(&self, index: usize) -> Result<ScriptValue, ScriptError> {
        let initializer = match self.constants.lock().get(index) {
            Some(ConstantEntry::Ready(value)) => return Ok(value.clone()),
            Some(ConstantEntry::Lazy(initializer)) => initializer.clone(),
            None => return Err(ScriptError::ConstantIndex(index)),
        };
        // the initializer may itself resolve constants of this unit
        let value = initializer.resolve()?;
        let mut constants = self.constants.lock();
        if let Some(ConstantEntry::Lazy(_)) = constants.get(index) {
            log::trace!("{}: resolved lazy constant {index}", self.global_name());
            constants[index] = ConstantEntry::Ready(value.clone());
        }
        Ok(value)
    }

    /// Whether constant `index` still awaits its initializer.
    pub fn is_lazy(&self, index: usize) -> bool {
        matches!(self.constants.lock().get(index), Some(ConstantEntry::Lazy(_)))
    }

    /// Run the unit. Missing arguments are `undefined`.
    pub fn invoke(
        self: &Arc<Self>,
        globals: &Globals,
        this: ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError> {
        Activation::new(self, globals, this, args).run(&self.body)
    }
}

pub(crate) fn next_id() -> u64 {
    NEXT_COMPILATION_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn global_name(id: u64) -> String {
    format!("$$F{id}")
}
