use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::script::ScriptId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running)
    }

    /// Terminal states are the outcome of a run; `Idle` is not one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub last_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RunState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn running(started_at: DateTime<Utc>, pid: u32) -> Self {
        Self {
            status: RunStatus::Running,
            last_message: format!("running (pid {pid})"),
            started_at: Some(started_at),
            ended_at: None,
            exit_code: None,
        }
    }

    /// A process adopted after a manager restart.
    pub fn restored(started_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Running,
            last_message: "restored".to_string(),
            started_at: Some(started_at),
            ended_at: None,
            exit_code: None,
        }
    }

    pub fn failed(message: impl Into<String>, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            status: RunStatus::Failed,
            last_message: message.into(),
            started_at,
            ended_at: Some(Utc::now()),
            exit_code: None,
        }
    }

    pub fn stopped(started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            status: RunStatus::Stopped,
            last_message: "stopped".to_string(),
            started_at,
            ended_at: Some(Utc::now()),
            exit_code: None,
        }
    }

    /// Outcome of a process that exited on its own.
    pub fn finished(exit_code: i32, started_at: Option<DateTime<Utc>>) -> Self {
        let (status, last_message) = if exit_code == 0 {
            (RunStatus::Success, "exited successfully".to_string())
        } else {
            (RunStatus::Failed, format!("exited with code {exit_code}"))
        };
        Self {
            status,
            last_message,
            started_at,
            ended_at: Some(Utc::now()),
            exit_code: Some(exit_code),
        }
    }
}

/// Published on every RunState transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStateChange {
    pub id: ScriptId,
    pub state: RunState,
}
