use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::Executor;
use crate::pool::AddressPool;

/// Everything reconciliation needs besides the topology itself.
pub struct Context {
    exec: Arc<dyn Executor>,
    pool: AddressPool,
    output_dir: PathBuf,
}

impl Context {
    /// Process output goes to the system temp directory unless overridden.
    pub fn new(exec: Arc<dyn Executor>, pool: AddressPool) -> Self {
        Self {
            exec,
            pool,
            output_dir: std::env::temp_dir(),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn exec(&self) -> &dyn Executor {
        self.exec.as_ref()
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}
