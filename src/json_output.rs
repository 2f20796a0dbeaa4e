//! JSON Output for motion and gripper commands
//!
//! Structured status and error events on stdout, one JSON object per line, so
//! external tools can follow what the binary is doing.

use serde::{Deserialize, Serialize};

use crate::snapshot::CommandId;
use crate::DobotError;

/// Current wall-clock time in seconds, rounded to microseconds
pub fn current_timestamp() -> f64 {
    let micros = chrono::Utc::now().timestamp_micros();
    micros as f64 / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Sent,
    Completed,
    Rejected,
    Timeout,
    Cancelled,
    Failed,
}

impl CommandStatus {
    /// Status that best describes a failed command
    pub fn from_error(error: &DobotError) -> Self {
        match error {
            DobotError::Rejected { .. } | DobotError::WrongControlMode { .. } => CommandStatus::Rejected,
            DobotError::Timeout { .. } => CommandStatus::Timeout,
            DobotError::Cancelled { .. } => CommandStatus::Cancelled,
            _ => CommandStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Id assigned by the controller; absent when the command never got one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    pub status: CommandStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Error not tied to a single command, or a gripper failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    pub error: String,
}

/// One force/torque sensor reading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// [Fx, Fy, Fz] in N
    pub force: [f64; 3],
    /// [Mx, My, Mz] in Nm
    pub torque: [f64; 3],
}

impl ForceEvent {
    pub fn new(reading: [f64; 6]) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "force".to_string(),
            force: [reading[0], reading[1], reading[2]],
            torque: [reading[3], reading[4], reading[5]],
        }
    }
}

impl CommandStatusEvent {
    pub fn new(command_id: Option<CommandId>, status: CommandStatus, message: &str, command: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "command_status".to_string(),
            command_id,
            status,
            message: message.to_string(),
            command,
        }
    }

    pub fn sent(command_id: CommandId, command: &str) -> Self {
        Self::new(
            Some(command_id),
            CommandStatus::Sent,
            "Command queued on controller",
            Some(command.to_string()),
        )
    }

    pub fn completed(command_id: CommandId) -> Self {
        Self::new(Some(command_id), CommandStatus::Completed, "Command execution finished", None)
    }

    /// Failure before or after an id was assigned
    pub fn failed(command_id: Option<CommandId>, command: &str, error: &DobotError) -> Self {
        Self::new(
            command_id,
            CommandStatus::from_error(error),
            &error.to_string(),
            Some(command.to_string()),
        )
    }
}

impl ErrorEvent {
    pub fn new(error: &str, command_id: Option<CommandId>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            command_id,
            error: error.to_string(),
        }
    }

    pub fn gripper(error: &DobotError) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "gripper_error".to_string(),
            command_id: None,
            error: error.to_string(),
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    pub fn command_sent(command_id: CommandId, command: &str) {
        output_event(&CommandStatusEvent::sent(command_id, command));
    }

    pub fn command_completed(command_id: CommandId) {
        output_event(&CommandStatusEvent::completed(command_id));
    }

    pub fn command_failed(command_id: Option<CommandId>, command: &str, error: &DobotError) {
        output_event(&CommandStatusEvent::failed(command_id, command, error));
    }

    pub fn gripper_error(error: &DobotError) {
        output_event(&ErrorEvent::gripper(error));
    }

    pub fn force(reading: [f64; 6]) {
        output_event(&ForceEvent::new(reading));
    }

    pub fn error(message: &str) {
        output_event(&ErrorEvent::new(message, None));
    }
}
