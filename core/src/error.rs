use thiserror::Error;

use crate::script::ScriptId;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("script {id} is disabled")]
    ScriptDisabled { id: ScriptId },
    #[error("script {id} has an empty command")]
    EmptyCommand { id: ScriptId },
    #[error("script {id} is already running")]
    AlreadyRunning { id: ScriptId },
    #[error("failed to start script {id}: {source}")]
    StartFailed {
        id: ScriptId,
        #[source]
        source: std::io::Error,
    },
    /// Reserved: `stop` on an unknown script is currently a no-op.
    #[error("script {id} is not running")]
    NotRunning { id: ScriptId },
}

impl LifecycleError {
    pub(crate) fn start_failed(id: &ScriptId, source: std::io::Error) -> Self {
        Self::StartFailed {
            id: id.clone(),
            source,
        }
    }

    pub fn script_id(&self) -> &ScriptId {
        match self {
            Self::ScriptDisabled { id }
            | Self::EmptyCommand { id }
            | Self::AlreadyRunning { id }
            | Self::StartFailed { id, .. }
            | Self::NotRunning { id } => id,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
