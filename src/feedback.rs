//! Real-time feedback stream decoding
//!
//! The controller pushes a fixed 1440-byte frame on the feedback port
//! (30004) several times per second. [`StateFeed`] reads the stream, aligns
//! frames on the test-value magic, decodes the fields this crate consumes and
//! publishes them through a [`SnapshotPublisher`].

use crate::config::FeedConfig;
use crate::snapshot::{RobotMode, SnapshotPublisher, StatusFlags, TelemetrySnapshot};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Size of one feedback frame in bytes
pub const FRAME_LEN: usize = 1440;

/// Memory-layout test value every valid frame carries
pub const TEST_VALUE_MAGIC: u64 = 0x0123_4567_89AB_CDEF;

/// Byte offsets of the consumed fields (all little-endian)
pub mod offsets {
    pub const MESSAGE_SIZE: usize = 0;
    pub const DIGITAL_INPUTS: usize = 8;
    pub const DIGITAL_OUTPUTS: usize = 16;
    pub const ROBOT_MODE: usize = 24;
    pub const TIMESTAMP: usize = 32;
    pub const TEST_VALUE: usize = 48;
    pub const SPEED_SCALING: usize = 64;
    pub const Q_ACTUAL: usize = 432;
    pub const TOOL_VECTOR_ACTUAL: usize = 624;
    pub const BRAKE_STATUS: usize = 1025;
    pub const ENABLE_STATUS: usize = 1026;
    pub const DRAG_STATUS: usize = 1027;
    pub const RUNNING_STATUS: usize = 1028;
    pub const ERROR_STATUS: usize = 1029;
    pub const JOG_STATUS: usize = 1030;
    pub const COLLISION_STATE: usize = 1038;
    pub const CURRENT_COMMAND_ID: usize = 1112;
}

const MAGIC_BYTES: [u8; 8] = TEST_VALUE_MAGIC.to_le_bytes();

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Test value mismatch: 0x{0:016x}")]
    BadMagic(u64),

    #[error("Unknown robot mode code {0}")]
    UnknownRobotMode(u64),
}

fn read_u64(frame: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_f64(frame: &[u8], offset: usize) -> f64 {
    f64::from_bits(read_u64(frame, offset))
}

fn read_vector6(frame: &[u8], offset: usize) -> [f64; 6] {
    let mut values = [0.0; 6];
    for (i, value) in values.iter_mut().enumerate() {
        *value = read_f64(frame, offset + i * 8);
    }
    values
}

/// Decode one frame; `sequence` and `received_at` are left at zero for the
/// caller to stamp.
pub fn decode_frame(frame: &[u8]) -> Result<TelemetrySnapshot, FrameError> {
    if frame.len() != FRAME_LEN {
        return Err(FrameError::InvalidLength {
            expected: FRAME_LEN,
            actual: frame.len(),
        });
    }

    let test_value = read_u64(frame, offsets::TEST_VALUE);
    if test_value != TEST_VALUE_MAGIC {
        return Err(FrameError::BadMagic(test_value));
    }

    let mode_code = read_u64(frame, offsets::ROBOT_MODE);
    let robot_mode = RobotMode::from_code(mode_code).ok_or(FrameError::UnknownRobotMode(mode_code))?;

    let flag = |offset: usize| frame[offset] != 0;

    Ok(TelemetrySnapshot {
        robot_mode,
        active_command_id: read_u64(frame, offsets::CURRENT_COMMAND_ID),
        message_size: u16::from_le_bytes([frame[offsets::MESSAGE_SIZE], frame[offsets::MESSAGE_SIZE + 1]]),
        digital_inputs: read_u64(frame, offsets::DIGITAL_INPUTS),
        digital_outputs: read_u64(frame, offsets::DIGITAL_OUTPUTS),
        joint_angles: read_vector6(frame, offsets::Q_ACTUAL),
        tool_pose: read_vector6(frame, offsets::TOOL_VECTOR_ACTUAL),
        speed_scaling: read_f64(frame, offsets::SPEED_SCALING),
        controller_time_ms: read_u64(frame, offsets::TIMESTAMP),
        status: StatusFlags {
            brake: flag(offsets::BRAKE_STATUS),
            enabled: flag(offsets::ENABLE_STATUS),
            drag: flag(offsets::DRAG_STATUS),
            running: flag(offsets::RUNNING_STATUS),
            error: flag(offsets::ERROR_STATUS),
            jog: flag(offsets::JOG_STATUS),
            collision: flag(offsets::COLLISION_STATE),
        },
        sequence: 0,
        received_at: 0.0,
    })
}

/// Accumulates stream bytes and yields magic-aligned frames.
///
/// When the bytes at the expected test-value position are not the magic, the
/// buffer is advanced to the next place the magic occurs, discarding whatever
/// precedes that frame.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    skipped_bytes: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_LEN * 2),
            skipped_bytes: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes dropped so far while realigning
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn magic_at(&self, position: usize) -> bool {
        self.buffer.get(position..position + MAGIC_BYTES.len()) == Some(&MAGIC_BYTES[..])
    }

    fn skip(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.skipped_bytes += count as u64;
    }

    /// Next aligned frame, or `None` until more bytes arrive
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buffer.len() < FRAME_LEN {
                return None;
            }

            if self.magic_at(offsets::TEST_VALUE) {
                return Some(self.buffer.drain(..FRAME_LEN).collect());
            }

            let next_magic = self.buffer[offsets::TEST_VALUE + 1..]
                .windows(MAGIC_BYTES.len())
                .position(|window| window == MAGIC_BYTES)
                .map(|p| p + offsets::TEST_VALUE + 1);

            match next_magic {
                Some(position) => self.skip(position - offsets::TEST_VALUE),
                None => {
                    // Keep the tail that could still hold the start of a frame
                    let keep = offsets::TEST_VALUE + MAGIC_BYTES.len() - 1;
                    let excess = self.buffer.len() - keep;
                    self.skip(excess);
                    return None;
                }
            }
        }
    }
}

/// Notifications raised by the feed for other components
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The robot switched into error mode; carries the snapshot that showed it
    ErrorEntered(Arc<TelemetrySnapshot>),
}

/// Counters describing feed health
#[derive(Debug, Default)]
pub struct FeedStats {
    pub frames_published: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub bytes_skipped: AtomicU64,
    pub read_errors: AtomicU64,
}

/// Background reader that turns the feedback stream into snapshots
pub struct StateFeed<R> {
    reader: R,
    publisher: SnapshotPublisher,
    connected: Arc<AtomicBool>,
    config: FeedConfig,
    events: Option<mpsc::Sender<FeedEvent>>,
    stats: Arc<FeedStats>,
}

impl<R> StateFeed<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Create a feed that runs while `connected` stays true
    pub fn new(reader: R, publisher: SnapshotPublisher, connected: Arc<AtomicBool>) -> Self {
        Self {
            reader,
            publisher,
            connected,
            config: FeedConfig::default(),
            events: None,
            stats: Arc::new(FeedStats::default()),
        }
    }

    pub fn with_config(mut self, config: FeedConfig) -> Self {
        self.config = config;
        self
    }

    /// Deliver [`FeedEvent`]s on `sender`; events are dropped when it is full
    pub fn with_events(mut self, sender: mpsc::Sender<FeedEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    /// Detach the loop onto the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Read, validate and publish until the connection flag is cleared
    pub async fn run(mut self) {
        info!("Telemetry feed started");

        let mut assembler = FrameAssembler::new();
        let mut chunk = vec![0u8; self.config.read_chunk_bytes.max(FRAME_LEN)];
        let mut sequence = 0u64;
        let mut last_mode: Option<RobotMode> = None;

        while self.connected.load(Ordering::Acquire) {
            let read = tokio::time::timeout(self.config.read_timeout(), self.reader.read(&mut chunk)).await;

            match read {
                // Nothing arrived in time; loop to re-check the connection flag
                Err(_) => continue,
                Ok(Ok(0)) => {
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("Feedback stream returned EOF, retrying");
                    tokio::time::sleep(self.config.retry_delay()).await;
                    continue;
                }
                Ok(Ok(n)) => assembler.push(&chunk[..n]),
                Ok(Err(e)) => {
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Feedback read error: {}", e);
                    tokio::time::sleep(self.config.retry_delay()).await;
                    continue;
                }
            }

            while let Some(frame) = assembler.next_frame() {
                match decode_frame(&frame) {
                    Ok(mut snapshot) => {
                        sequence += 1;
                        snapshot.sequence = sequence;
                        snapshot.received_at = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

                        let entered_error =
                            snapshot.robot_mode == RobotMode::Error && last_mode != Some(RobotMode::Error);
                        last_mode = Some(snapshot.robot_mode);

                        let snapshot = Arc::new(snapshot);
                        self.publisher.publish(snapshot.clone());
                        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);

                        if entered_error {
                            warn!("Robot entered error mode");
                            self.notify(FeedEvent::ErrorEntered(snapshot));
                        }
                    }
                    Err(e) => {
                        self.stats.frames_discarded.fetch_add(1, Ordering::Relaxed);
                        debug!("Discarding feedback frame: {}", e);
                    }
                }
            }

            let skipped = assembler.skipped_bytes();
            let previous = self.stats.bytes_skipped.swap(skipped, Ordering::Relaxed);
            if skipped > previous {
                debug!("Resynchronized feedback stream, skipped {} bytes", skipped - previous);
            }
        }

        info!("Telemetry feed stopped");
    }

    fn notify(&self, event: FeedEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                debug!("Feed event dropped, receiver busy or gone");
            }
        }
    }
}

/// Build a valid frame for tests
#[cfg(test)]
pub(crate) fn encode_frame(snapshot: &TelemetrySnapshot) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_LEN];
    let put_u64 = |frame: &mut Vec<u8>, offset: usize, value: u64| {
        frame[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    };

    frame[0..2].copy_from_slice(&snapshot.message_size.to_le_bytes());
    put_u64(&mut frame, offsets::DIGITAL_INPUTS, snapshot.digital_inputs);
    put_u64(&mut frame, offsets::DIGITAL_OUTPUTS, snapshot.digital_outputs);
    put_u64(&mut frame, offsets::ROBOT_MODE, snapshot.robot_mode.code());
    put_u64(&mut frame, offsets::TIMESTAMP, snapshot.controller_time_ms);
    put_u64(&mut frame, offsets::TEST_VALUE, TEST_VALUE_MAGIC);
    put_u64(&mut frame, offsets::SPEED_SCALING, snapshot.speed_scaling.to_bits());
    for i in 0..6 {
        put_u64(&mut frame, offsets::Q_ACTUAL + i * 8, snapshot.joint_angles[i].to_bits());
        put_u64(&mut frame, offsets::TOOL_VECTOR_ACTUAL + i * 8, snapshot.tool_pose[i].to_bits());
    }
    frame[offsets::BRAKE_STATUS] = snapshot.status.brake as u8;
    frame[offsets::ENABLE_STATUS] = snapshot.status.enabled as u8;
    frame[offsets::DRAG_STATUS] = snapshot.status.drag as u8;
    frame[offsets::RUNNING_STATUS] = snapshot.status.running as u8;
    frame[offsets::ERROR_STATUS] = snapshot.status.error as u8;
    frame[offsets::JOG_STATUS] = snapshot.status.jog as u8;
    frame[offsets::COLLISION_STATE] = snapshot.status.collision as u8;
    put_u64(&mut frame, offsets::CURRENT_COMMAND_ID, snapshot.active_command_id);
    frame
}
