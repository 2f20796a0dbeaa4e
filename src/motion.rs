//! Motion dispatch and completion tracking
//!
//! A motion command is queued on the dashboard port, which answers with the id
//! it assigned. Completion is observed on the feedback stream: the command is
//! done once the robot is back in enabled mode with that id current.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MotionConfig;
use crate::dashboard::{check_ratio, ControlChannel, DashboardExt};
use crate::reply::parse_reply;
use crate::snapshot::{CommandId, SnapshotReader, TelemetrySnapshot};
use crate::{DobotError, Result};

/// Interpolation used by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionKind {
    /// Joint-space move (`MovJ`)
    Joint,
    /// Straight-line Cartesian move (`MovL`)
    Linear,
}

impl MotionKind {
    fn command_name(self) -> &'static str {
        match self {
            MotionKind::Joint => "MovJ",
            MotionKind::Linear => "MovL",
        }
    }
}

/// Where the move should end
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// Tool pose [x, y, z, rx, ry, rz] in mm and degrees
    Pose([f64; 6]),
    /// Joint angles in degrees
    Joints([f64; 6]),
}

/// A single move with its optional blending and speed parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionCommand {
    pub kind: MotionKind,
    pub target: Target,
    /// Blend radius in mm, linear moves only; wins over `blend_ratio`
    pub blend_radius: Option<f64>,
    /// Continuous-path ratio, 0..=100
    pub blend_ratio: Option<u8>,
    /// Velocity ratio, 1..=100
    pub velocity_ratio: Option<u8>,
}

impl MotionCommand {
    pub fn new(kind: MotionKind, target: Target) -> Self {
        Self {
            kind,
            target,
            blend_radius: None,
            blend_ratio: None,
            velocity_ratio: None,
        }
    }

    pub fn movj(pose: [f64; 6]) -> Self {
        Self::new(MotionKind::Joint, Target::Pose(pose))
    }

    pub fn movj_joints(joints: [f64; 6]) -> Self {
        Self::new(MotionKind::Joint, Target::Joints(joints))
    }

    pub fn movl(pose: [f64; 6]) -> Self {
        Self::new(MotionKind::Linear, Target::Pose(pose))
    }

    pub fn with_blend_radius(mut self, radius_mm: f64) -> Self {
        self.blend_radius = Some(radius_mm);
        self
    }

    pub fn with_blend_ratio(mut self, ratio: u8) -> Self {
        self.blend_ratio = Some(ratio);
        self
    }

    pub fn with_velocity(mut self, ratio: u8) -> Self {
        self.velocity_ratio = Some(ratio);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let values = match &self.target {
            Target::Pose(v) | Target::Joints(v) => v,
        };
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DobotError::InvalidCommand(format!("Non-finite target in {:?}", self.target)));
        }
        if let Some(radius) = self.blend_radius {
            if self.kind != MotionKind::Linear {
                return Err(DobotError::InvalidCommand("Blend radius is only accepted by MovL".to_string()));
            }
            if !radius.is_finite() || radius < 0.0 {
                return Err(DobotError::InvalidCommand(format!("Blend radius {} must be a non-negative number", radius)));
            }
        }
        if let Some(ratio) = self.blend_ratio {
            if ratio > 100 {
                return Err(DobotError::InvalidCommand(format!("Blend ratio {} outside 0..=100", ratio)));
            }
        }
        if let Some(ratio) = self.velocity_ratio {
            check_ratio("velocity", ratio)?;
        }
        Ok(())
    }

    /// Dashboard text for this move, e.g. `MovL(pose={...},v=20,r=2)`
    pub fn to_command_string(&self) -> String {
        let (label, values) = match &self.target {
            Target::Pose(v) => ("pose", v),
            Target::Joints(v) => ("joint", v),
        };
        let values: Vec<String> = values.iter().map(|v| format!("{:.6}", v)).collect();

        let mut text = format!("{}({}={{{}}}", self.kind.command_name(), label, values.join(","));
        if let Some(v) = self.velocity_ratio {
            text.push_str(&format!(",v={}", v));
        }
        match (self.blend_radius, self.blend_ratio) {
            (Some(r), _) if self.kind == MotionKind::Linear => text.push_str(&format!(",r={}", r)),
            (_, Some(cp)) => text.push_str(&format!(",cp={}", cp)),
            _ => {}
        }
        text.push(')');
        text
    }
}

impl fmt::Display for MotionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_command_string())
    }
}

/// Acceptable distance between the tool and a target pose
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseTolerance {
    pub position_mm: f64,
    pub rotation_deg: f64,
}

impl Default for PoseTolerance {
    fn default() -> Self {
        Self {
            position_mm: 1.0,
            rotation_deg: 1.0,
        }
    }
}

impl PoseTolerance {
    pub fn contains(&self, actual: &[f64; 6], target: &[f64; 6]) -> bool {
        let distance = (0..3)
            .map(|i| (actual[i] - target[i]).powi(2))
            .sum::<f64>()
            .sqrt();
        if distance > self.position_mm {
            return false;
        }
        (3..6).all(|i| angle_difference(actual[i], target[i]).abs() <= self.rotation_deg)
    }
}

/// Signed difference in degrees, wrapped into [-180, 180)
fn angle_difference(a: f64, b: f64) -> f64 {
    (a - b + 180.0).rem_euclid(360.0) - 180.0
}

/// Cancels the waits that were running when [`cancel`](Self::cancel) was called
///
/// Each wait remembers the generation it started under and ends once the
/// generation moves on; waits started afterwards are unaffected.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    generation: Arc<AtomicU64>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn token(&self) -> CancelToken<'_> {
        CancelToken {
            handle: self,
            started: self.current(),
        }
    }
}

struct CancelToken<'a> {
    handle: &'a CancelHandle,
    started: u64,
}

impl CancelToken<'_> {
    fn is_cancelled(&self) -> bool {
        self.handle.current() != self.started
    }
}

/// `tokio::time::interval` panics on a zero period
fn poll_ticker(period: Duration, what: &str, behavior: MissedTickBehavior) -> Result<Interval> {
    if period.is_zero() {
        return Err(DobotError::InvalidCommand(format!("{} must be positive", what)));
    }
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(behavior);
    Ok(ticker)
}

/// Sends moves and tracks them to completion against the live snapshot
pub struct MotionDispatcher<C: ?Sized> {
    channel: Arc<C>,
    snapshots: SnapshotReader,
    config: MotionConfig,
    cancel: CancelHandle,
}

impl<C: ?Sized> Clone for MotionDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            snapshots: self.snapshots.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C> MotionDispatcher<C>
where
    C: ControlChannel + ?Sized,
{
    pub fn new(channel: Arc<C>, snapshots: SnapshotReader, config: MotionConfig) -> Self {
        Self {
            channel,
            snapshots,
            config,
            cancel: CancelHandle::default(),
        }
    }

    /// Shared by every clone of this dispatcher
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// End every wait and stream currently in progress
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn snapshots(&self) -> &SnapshotReader {
        &self.snapshots
    }

    /// Queue a move and return the id the controller assigned to it
    pub async fn send(&self, command: &MotionCommand) -> Result<CommandId> {
        let mut command = command.clone();
        if command.velocity_ratio.is_none() {
            command.velocity_ratio = self.config.velocity_ratio;
        }
        command.validate()?;

        let text = command.to_command_string();

        let reply = self.channel.request(&text).await?;
        let ack = match parse_reply(&reply) {
            Ok(ack) => ack,
            Err(e @ DobotError::WrongControlMode { .. }) => {
                warn!("Controller is not in TCP mode, {} not accepted", text);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if ack.is_rejected() {
            warn!("{} rejected with code {}, stopping", text, ack.code);
            if let Err(e) = self.channel.stop().await {
                warn!("Stop after rejection failed: {}", e);
            }
            return Err(DobotError::Rejected {
                code: ack.code,
                reply: ack.raw,
            });
        }

        let command_id = ack.command_id()?;
        debug!("{} queued as command {}", text, command_id);
        Ok(command_id)
    }

    /// Poll the snapshot until `command_id` has completed
    pub async fn await_completion(
        &self,
        command_id: CommandId,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Arc<TelemetrySnapshot>> {
        let token = self.cancel.token();
        let mut ticker = poll_ticker(poll_interval, "poll interval", MissedTickBehavior::Skip)?;
        let started = Instant::now();

        loop {
            ticker.tick().await;

            if token.is_cancelled() {
                info!("Wait for command {} cancelled", command_id);
                return Err(DobotError::Cancelled { command_id });
            }

            if let Some(snapshot) = self.snapshots.latest() {
                if snapshot.is_command_complete(command_id) {
                    debug!("Command {} completed after {:?}", command_id, started.elapsed());
                    return Ok(snapshot);
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!("Command {} still running after {:?}", command_id, waited);
                return Err(DobotError::Timeout { command_id, waited });
            }
        }
    }

    /// Send a move and wait for it with the configured poll interval and timeout
    pub async fn execute(&self, command: &MotionCommand) -> Result<CommandId> {
        let command_id = self.send(command).await?;
        self.await_completion(command_id, self.config.poll_interval(), self.config.completion_timeout())
            .await?;
        Ok(command_id)
    }

    /// Queue moves one after another at a fixed pace without waiting for
    /// completion; stops at the first move the controller refuses.
    pub async fn stream(&self, commands: &[MotionCommand], interval: Duration) -> Result<Vec<CommandId>> {
        let token = self.cancel.token();
        let mut ticker = poll_ticker(interval, "stream interval", MissedTickBehavior::Delay)?;
        let mut ids = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            ticker.tick().await;
            if token.is_cancelled() {
                info!("Stream cancelled after {} of {} moves", index, commands.len());
                break;
            }
            match self.send(command).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    warn!("Stream stopped at move {} of {}: {}", index + 1, commands.len(), e);
                    return Err(e);
                }
            }
        }

        info!("Streamed {} moves", ids.len());
        Ok(ids)
    }

    /// Poll until the tool pose is within `tolerance` of `target`
    pub async fn wait_until_near(
        &self,
        target: [f64; 6],
        tolerance: PoseTolerance,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Arc<TelemetrySnapshot>> {
        let mut ticker = poll_ticker(poll_interval, "poll interval", MissedTickBehavior::Skip)?;
        let started = Instant::now();

        loop {
            ticker.tick().await;

            if let Some(snapshot) = self.snapshots.latest() {
                if tolerance.contains(&snapshot.tool_pose, &target) {
                    return Ok(snapshot);
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(DobotError::TargetNotReached { waited });
            }
        }
    }

    /// Halt motion and flush the controller queue
    pub async fn stop(&self) -> Result<()> {
        self.cancel();
        self.channel.stop().await
    }
}
