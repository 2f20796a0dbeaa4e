//! dobotd - Dobot arm state sync, motion dispatch and vacuum gripper control
//!
//! The controller exposes two TCP ports: a text dashboard that accepts one
//! command at a time, and a feedback port that pushes a fixed binary frame
//! several times a second. This crate keeps a live snapshot of the feedback
//! stream, tracks queued motions to completion against it, and drives a
//! vacuum gripper through the controller's Modbus bridge.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dobotd::{Config, MotionCommand, RobotController};
//!
//! #[tokio::main]
//! async fn main() -> dobotd::Result<()> {
//!     let mut robot = RobotController::connect(Config::load("config/default_config.yaml")?).await?;
//!
//!     let id = robot.motion().execute(&MotionCommand::movj([300.0, 0.0, 200.0, 180.0, 0.0, 0.0])).await?;
//!     println!("Command {} finished", id);
//!
//!     let gripper = robot.open_gripper().await?;
//!     gripper.init().await?;
//!     gripper.grip(60, 20, 3000).await?;
//!
//!     robot.shutdown().await
//! }
//! ```
//!
//! # Architecture
//!
//! - **StateFeed**: reads feedback frames and publishes [`TelemetrySnapshot`]s
//! - **MotionDispatcher**: queues moves and waits for their completion
//! - **VacuumGripper**: serialized register sequences for the gripper
//! - **RobotController**: connects everything to one controller

pub mod config;
pub mod controller;
pub mod dashboard;
pub mod error;
pub mod feedback;
pub mod gripper;
pub mod json_output;
pub mod monitoring;
pub mod motion;
pub mod reply;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, FeedConfig, GripperConfig, MotionConfig, PublishingConfig, RobotConfig};
pub use controller::{DashboardGripper, RobotController};
pub use dashboard::{ControlChannel, DashboardClient, DashboardExt, Jog, JogAxis};
pub use error::{DobotError, Result};
pub use feedback::{decode_frame, FeedEvent, FeedStats, FrameAssembler, FrameError, StateFeed, FRAME_LEN};
pub use gripper::{ActionWord, DashboardModbusBridge, RegisterChannel, VacuumGripper};
pub use json_output::{CommandStatus, CommandStatusEvent, ErrorEvent, ForceEvent};
pub use monitoring::{MonitorOutput, PositionData, RobotStateData};
pub use motion::{CancelHandle, MotionCommand, MotionDispatcher, MotionKind, PoseTolerance, Target};
pub use reply::{parse_reply, CommandAck};
pub use snapshot::{snapshot_channel, CommandId, RobotMode, SnapshotPublisher, SnapshotReader, StatusFlags, TelemetrySnapshot};
