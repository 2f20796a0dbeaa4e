//! Robot controller for Dobot arms
//!
//! Owns the dashboard connection and the feedback stream, keeps the
//! telemetry feed running in the background, and hands out the motion
//! dispatcher and gripper that share the dashboard link.

use crate::{
    config::Config,
    dashboard::{ControlChannel, DashboardClient, DashboardExt},
    feedback::{FeedEvent, FeedStats, StateFeed},
    gripper::{DashboardModbusBridge, VacuumGripper},
    motion::MotionDispatcher,
    snapshot::{snapshot_channel, SnapshotReader, TelemetrySnapshot},
    DobotError, Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Gripper driven over the dashboard's Modbus bridge
pub type DashboardGripper = VacuumGripper<DashboardModbusBridge<DashboardClient>>;

/// Pending error-mode notifications before the feed starts dropping them
const FEED_EVENT_CAPACITY: usize = 8;

/// Connected robot with a running telemetry feed
pub struct RobotController {
    config: Config,
    dashboard: Arc<DashboardClient>,
    snapshots: SnapshotReader,
    connected: Arc<AtomicBool>,
    feed_stats: Arc<FeedStats>,
    feed_handle: Option<JoinHandle<()>>,
    alarm_handle: Option<JoinHandle<()>>,
    motion: MotionDispatcher<DashboardClient>,
    gripper: Arc<DashboardGripper>,
}

impl RobotController {
    /// Connect both ports and start the telemetry feed
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let host = config.robot.host.clone();
        let connection = &config.robot.connection;
        info!("Connecting to Dobot controller at {}", host);

        let dashboard = Arc::new(
            DashboardClient::new(&host, Some(config.robot.ports.dashboard))
                .with_reply_timeout(connection.reply_timeout()),
        );
        dashboard.connect(connection.connect_timeout()).await?;

        let feedback_port = config.robot.ports.feedback;
        let feedback = tokio::time::timeout(
            connection.connect_timeout(),
            TcpStream::connect((host.as_str(), feedback_port)),
        )
        .await
        .map_err(|_| DobotError::Connection(format!("Timed out connecting to feedback port {}:{}", host, feedback_port)))?
        .map_err(|e| DobotError::Connection(format!("Failed to connect to feedback port {}:{}: {}", host, feedback_port, e)))?;
        info!("Connected to feedback stream at {}:{}", host, feedback_port);

        let connected = Arc::new(AtomicBool::new(true));
        let (publisher, snapshots) = snapshot_channel();
        let (events_tx, events_rx) = mpsc::channel(FEED_EVENT_CAPACITY);

        let feed = StateFeed::new(feedback, publisher, connected.clone())
            .with_config(config.feed.clone())
            .with_events(events_tx);
        let feed_stats = feed.stats();
        let feed_handle = feed.spawn();
        let alarm_handle = tokio::spawn(report_alarms(dashboard.clone(), events_rx));

        let motion = MotionDispatcher::new(dashboard.clone(), snapshots.clone(), config.motion.clone());
        let bridge = DashboardModbusBridge::new(dashboard.clone(), config.gripper.clone());
        let gripper = Arc::new(VacuumGripper::new(bridge, &config.gripper));

        Ok(Self {
            config,
            dashboard,
            snapshots,
            connected,
            feed_stats,
            feed_handle: Some(feed_handle),
            alarm_handle: Some(alarm_handle),
            motion,
            gripper,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dashboard link, for commands outside motion and gripper control
    pub fn dashboard(&self) -> &Arc<DashboardClient> {
        &self.dashboard
    }

    pub fn snapshots(&self) -> SnapshotReader {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.snapshots.latest()
    }

    pub fn motion(&self) -> &MotionDispatcher<DashboardClient> {
        &self.motion
    }

    pub fn gripper(&self) -> Arc<DashboardGripper> {
        self.gripper.clone()
    }

    pub fn feed_stats(&self) -> &FeedStats {
        &self.feed_stats
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Wait until the feed has published at least one snapshot
    pub async fn wait_for_telemetry(&self, timeout: Duration) -> Result<Arc<TelemetrySnapshot>> {
        if let Some(snapshot) = self.snapshots.latest() {
            return Ok(snapshot);
        }

        let mut reader = self.snapshots.clone();
        tokio::time::timeout(timeout, reader.next())
            .await
            .map_err(|_| DobotError::Connection(format!("No telemetry received within {:?}", timeout)))?
            .ok_or_else(|| DobotError::Connection("Telemetry feed stopped".to_string()))
    }

    /// Prepare the tool port and open the gripper's Modbus session
    pub async fn open_gripper(&self) -> Result<Arc<DashboardGripper>> {
        self.gripper.bridge().prepare_tool_port().await?;
        self.gripper.create_channel().await?;
        Ok(self.gripper.clone())
    }

    /// Abort pending motion waits and stop the arm
    pub async fn emergency_stop(&self) -> Result<()> {
        warn!("Emergency stop requested");
        self.motion.stop().await
    }

    /// Stop the feed and drop the connections
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down robot controller");
        self.connected.store(false, Ordering::Release);

        if self.gripper.is_open().await {
            // Best effort
            if let Err(e) = self.gripper.close_channel().await {
                warn!("Closing gripper session failed: {}", e);
            }
        }

        if let Some(handle) = self.feed_handle.take() {
            handle.await?;
        }
        if let Some(handle) = self.alarm_handle.take() {
            handle.await?;
        }

        self.dashboard.close().await;
        info!("Robot controller shutdown complete");
        Ok(())
    }
}

impl Drop for RobotController {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Log the controller's alarm ids whenever the robot enters error mode
async fn report_alarms<C>(dashboard: Arc<C>, mut events: mpsc::Receiver<FeedEvent>)
where
    C: ControlChannel + ?Sized,
{
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::ErrorEntered(snapshot) => match dashboard.error_ids().await {
                Ok(alarms) => error!(
                    "Robot in error mode (command {}), alarms: {}",
                    snapshot.active_command_id, alarms
                ),
                Err(e) => error!("Robot in error mode, alarm query failed: {}", e),
            },
        }
    }
}
