use crate::tunnel::TunnelSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumIs,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Stopped,
    Connecting,
    Running,
    Error,
}

impl TunnelStatus {
    pub fn style(&self) -> String {
        let s = self.to_string();
        match self {
            TunnelStatus::Stopped => console::style(s).dim().to_string(),
            TunnelStatus::Connecting => console::style(s).yellow().to_string(),
            TunnelStatus::Running => console::style(s).green().to_string(),
            TunnelStatus::Error => console::style(s).red().to_string(),
        }
    }

    /// Connecting and Running both own (or are about to own) a process.
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelStatus::Connecting | TunnelStatus::Running)
    }
}

/// What the registry currently believes about a tunnel's process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelRuntimeState {
    pub status: TunnelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TunnelRuntimeState {
    pub(crate) fn clear_process(&mut self) {
        self.pid = None;
        self.started_at = None;
    }
}

/// Detached copy of a tunnel handed out by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    #[serde(flatten)]
    pub spec: TunnelSpec,
    #[serde(flatten)]
    pub state: TunnelRuntimeState,
}

impl Tunnel {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn status(&self) -> TunnelStatus {
        self.state.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChangeEvent {
    pub id: String,
    pub old_status: TunnelStatus,
    pub new_status: TunnelStatus,
    pub error: Option<String>,
}
