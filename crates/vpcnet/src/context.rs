//! Execution context carried through every operation.

use std::path::PathBuf;
use std::time::Duration;

use crate::command::{DEFAULT_TIMEOUT, ExecMode, Executor};
use crate::rules::RuleManager;
use crate::store::{DEFAULT_DATA_DIR, Store};

/// Everything an operation needs, passed explicitly. No global state.
pub struct Context {
    pub store: Store,
    pub exec: Executor,
}

/// Knobs for building a [`Context`].
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Directory holding vpc documents.
    pub data_dir: PathBuf,
    /// Trace mutating commands instead of executing them.
    pub dry_run: bool,
    /// Upper bound on one link/filter command.
    pub timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            dry_run: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        let mode = if config.dry_run {
            ExecMode::DryRun
        } else {
            ExecMode::Live
        };
        Self {
            store: Store::new(config.data_dir),
            exec: Executor::new(mode, config.timeout),
        }
    }

    pub fn rules(&self) -> RuleManager<'_> {
        RuleManager::new(&self.exec)
    }
}
