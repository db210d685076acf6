use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control frames pushed from the server to an agent over its socket.
///
/// Serialized as `{"type": "...", ...}` envelopes; the tag values are part
/// of the agent wire protocol and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Initial acknowledgement sent right after a successful upgrade.
    Connected,
    SettingsUpdate {
        update_interval: u64,
    },
    ReportNow,
    UpdateNotification {
        version: String,
        #[serde(default)]
        force: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl AgentCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentCommand::Connected => "connected",
            AgentCommand::SettingsUpdate { .. } => "settings_update",
            AgentCommand::ReportNow => "report_now",
            AgentCommand::UpdateNotification { .. } => "update_notification",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is missing a target agent id")]
    MissingAgentId,
    #[error("unknown command type: {0}")]
    UnknownCommandType(String),
    #[error("settings_update requires an update_interval")]
    MissingUpdateInterval,
}

/// Queue-side body of a command job. Stored as JSON in the job row and
/// resolved to a concrete [`AgentCommand`] when the worker picks it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub agent_id: String,
    pub command_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval: Option<u64>,
}

impl CommandPayload {
    pub fn report_now(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            command_type: "report_now".to_string(),
            update_interval: None,
        }
    }

    pub fn settings_update(agent_id: impl Into<String>, update_interval: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            command_type: "settings_update".to_string(),
            update_interval: Some(update_interval),
        }
    }

    /// Validate the payload shape and resolve it to the command to dispatch.
    ///
    /// Any error here is permanent: retrying cannot make an unknown command
    /// type or a missing field parse differently.
    pub fn validate(&self) -> Result<AgentCommand, PayloadError> {
        if self.agent_id.trim().is_empty() {
            return Err(PayloadError::MissingAgentId);
        }
        match self.command_type.as_str() {
            "report_now" => Ok(AgentCommand::ReportNow),
            "settings_update" => {
                let update_interval = self
                    .update_interval
                    .ok_or(PayloadError::MissingUpdateInterval)?;
                Ok(AgentCommand::SettingsUpdate { update_interval })
            }
            other => Err(PayloadError::UnknownCommandType(other.to_string())),
        }
    }
}
