//! Dashboard (control port) client
//!
//! The dashboard port takes one text command at a time and answers with a
//! single `;`-terminated reply, except for the unterminated wrong-control-mode
//! notice. [`ControlChannel`] is the seam the motion and gripper layers talk
//! through; [`DashboardClient`] is the TCP implementation.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::reply::{parse_float_values, parse_reply, CommandAck, WRONG_CONTROL_MODE_MARKER};
use crate::{DobotError, Result};

/// Default dashboard port
pub const DOBOT_DASHBOARD_PORT: u16 = 29999;

/// Largest reply accepted before the connection is considered out of sync
const MAX_REPLY_BYTES: usize = 64 * 1024;

/// Request/response text link to the controller
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Send one command and return the raw reply text
    async fn request(&self, command: &str) -> Result<String>;
}

/// TCP client for the dashboard port
///
/// Request and reply are exchanged under one lock, so concurrent callers
/// sharing the client never see each other's replies.
pub struct DashboardClient {
    host: String,
    port: u16,
    stream: Mutex<Option<BufReader<TcpStream>>>,
    reply_timeout: Duration,
}

impl DashboardClient {
    /// Create a client; call [`connect`](Self::connect) before use
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self {
            host: host.to_string(),
            port: port.unwrap_or(DOBOT_DASHBOARD_PORT),
            stream: Mutex::new(None),
            reply_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Connect to the dashboard port
    pub async fn connect(&self, connect_timeout: Duration) -> Result<()> {
        let socket = tokio::time::timeout(connect_timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| DobotError::Connection(format!("Timed out connecting to {}:{}", self.host, self.port)))?
            .map_err(|e| DobotError::Connection(format!("Failed to connect to {}:{}: {}", self.host, self.port, e)))?;

        socket.set_nodelay(true)?;
        *self.stream.lock().await = Some(BufReader::new(socket));
        info!("Connected to dashboard at {}:{}", self.host, self.port);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Drop the connection
    pub async fn close(&self) {
        if self.stream.lock().await.take().is_some() {
            info!("Dashboard connection to {}:{} closed", self.host, self.port);
        }
    }
}

#[async_trait]
impl ControlChannel for DashboardClient {
    async fn request(&self, command: &str) -> Result<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| DobotError::Connection("Dashboard not connected".to_string()))?;

        debug!("dashboard <- {}", command);
        if let Err(e) = stream.get_mut().write_all(command.as_bytes()).await {
            guard.take();
            return Err(e.into());
        }

        let mut reply = Vec::new();
        let end = match tokio::time::timeout(self.reply_timeout, read_reply(stream, &mut reply)).await {
            Ok(end) => end,
            Err(_) => {
                // A late reply would be taken for the next command's
                guard.take();
                return Err(DobotError::Connection(format!("Dashboard reply timeout for {}", command)));
            }
        };

        match end {
            Ok(ReplyEnd::Complete) => {
                let reply = String::from_utf8_lossy(&reply).trim().to_string();
                debug!("dashboard -> {}", reply);
                Ok(reply)
            }
            Ok(ReplyEnd::Closed) => {
                guard.take();
                Err(DobotError::Connection("Dashboard closed the connection".to_string()))
            }
            Ok(ReplyEnd::Oversized) => {
                guard.take();
                Err(DobotError::Protocol(format!("Dashboard reply exceeds {} bytes", MAX_REPLY_BYTES)))
            }
            Err(e) => {
                guard.take();
                Err(e.into())
            }
        }
    }
}

enum ReplyEnd {
    Complete,
    Closed,
    Oversized,
}

/// Read up to the `;` terminator. The wrong-control-mode notice carries no
/// terminator and ends the reply as soon as it is seen.
async fn read_reply(stream: &mut BufReader<TcpStream>, reply: &mut Vec<u8>) -> std::io::Result<ReplyEnd> {
    let marker = WRONG_CONTROL_MODE_MARKER.as_bytes();
    loop {
        let available = stream.fill_buf().await?;
        if available.is_empty() {
            return Ok(ReplyEnd::Closed);
        }

        let (taken, terminated) = match available.iter().position(|b| *b == b';') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        reply.extend_from_slice(&available[..taken]);
        stream.consume(taken);

        if reply.len() > MAX_REPLY_BYTES {
            return Ok(ReplyEnd::Oversized);
        }
        if terminated || reply.windows(marker.len()).any(|w| w == marker) {
            return Ok(ReplyEnd::Complete);
        }
    }
}

/// Controller commands from the dashboard command set
#[async_trait]
pub trait DashboardExt: ControlChannel {
    /// Send a command and require a non-negative status code
    async fn command(&self, command: &str) -> Result<CommandAck> {
        let reply = self.request(command).await?;
        parse_reply(&reply)?.into_accepted()
    }

    async fn enable_robot(&self) -> Result<()> {
        self.command("EnableRobot()").await.map(|_| ())
    }

    async fn disable_robot(&self) -> Result<()> {
        self.command("DisableRobot()").await.map(|_| ())
    }

    async fn clear_error(&self) -> Result<()> {
        self.command("ClearError()").await.map(|_| ())
    }

    /// Stop motion and clear the controller's command queue
    async fn stop(&self) -> Result<()> {
        self.command("Stop()").await.map(|_| ())
    }

    /// Global speed ratio, 1..=100
    async fn speed_factor(&self, ratio: u8) -> Result<()> {
        check_ratio("speed factor", ratio)?;
        self.command(&format!("SpeedFactor({})", ratio)).await.map(|_| ())
    }

    /// Linear velocity ratio applied to following `MovL`, 1..=100
    async fn vel_l(&self, ratio: u8) -> Result<()> {
        check_ratio("linear velocity", ratio)?;
        self.command(&format!("VelL({})", ratio)).await.map(|_| ())
    }

    async fn set_digital_output(&self, index: u32, on: bool) -> Result<()> {
        self.command(&format!("DO({},{})", index, on as u8)).await.map(|_| ())
    }

    async fn start_drag(&self) -> Result<()> {
        self.command("StartDrag()").await.map(|_| ())
    }

    async fn stop_drag(&self) -> Result<()> {
        self.command("StopDrag()").await.map(|_| ())
    }

    /// Raw alarm id lists; mapping ids to text is left to the caller
    async fn error_ids(&self) -> Result<String> {
        self.request("GetErrorID()").await
    }

    /// Current tool pose [x, y, z, rx, ry, rz]
    async fn get_pose(&self) -> Result<[f64; 6]> {
        let reply = self.request("GetPose()").await?;
        six_values("GetPose", &reply)
    }

    /// Start jogging one axis; it keeps moving until [`stop_jog`](Self::stop_jog)
    async fn jog(&self, jog: Jog) -> Result<()> {
        let command = match jog.axis {
            JogAxis::Joint(_) => format!("MoveJog({})", jog),
            _ => format!("MoveJog({},coordtype=1,user=0,tool=0)", jog),
        };
        self.command(&command).await.map(|_| ())
    }

    async fn stop_jog(&self) -> Result<()> {
        self.command("MoveJog()").await.map(|_| ())
    }

    /// Drag-mode sensitivity for one axis (0 selects all), 1..=90
    async fn drag_sensitivity(&self, axis: u8, value: u8) -> Result<()> {
        if axis > 6 || !(1..=90).contains(&value) {
            return Err(DobotError::InvalidCommand(format!(
                "Drag sensitivity axis {} value {} outside 0..=6 / 1..=90",
                axis, value
            )));
        }
        self.command(&format!("DragSensivity({},{})", axis, value)).await.map(|_| ())
    }

    async fn enable_force_sensor(&self, on: bool) -> Result<()> {
        self.command(&format!("EnableFTSensor({})", on as u8)).await.map(|_| ())
    }

    /// Take the current force reading as the sensor's zero point
    async fn zero_force_sensor(&self) -> Result<()> {
        self.command("SixForceHome()").await.map(|_| ())
    }

    /// Force and torque [Fx, Fy, Fz, Mx, My, Mz] at the flange
    async fn get_force(&self) -> Result<[f64; 6]> {
        let reply = self.request("GetForce()").await?;
        six_values("GetForce", &reply)
    }
}

impl<C: ControlChannel + ?Sized> DashboardExt for C {}

fn six_values(what: &str, reply: &str) -> Result<[f64; 6]> {
    let values = parse_float_values(reply)?;
    values
        .get(..6)
        .and_then(|v| <[f64; 6]>::try_from(v).ok())
        .ok_or_else(|| DobotError::Protocol(format!("{} reply has {} values: {}", what, values.len(), reply)))
}

/// Axis moved by a jog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogAxis {
    /// Joint 1..=6
    Joint(u8),
    X,
    Y,
    Z,
    Rx,
    Ry,
    Rz,
}

/// One jog direction, written `J1+`, `X-`, `Rz+` and so on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jog {
    pub axis: JogAxis,
    pub positive: bool,
}

impl FromStr for Jog {
    type Err = DobotError;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = || {
            DobotError::InvalidCommand(format!(
                "Unknown jog axis {:?}, expected J1..J6 or X/Y/Z/Rx/Ry/Rz followed by + or -",
                text
            ))
        };

        let (name, positive) = match text.trim() {
            t if t.ends_with('+') => (&t[..t.len() - 1], true),
            t if t.ends_with('-') => (&t[..t.len() - 1], false),
            _ => return Err(invalid()),
        };

        let axis = match name.to_ascii_uppercase().as_str() {
            "X" => JogAxis::X,
            "Y" => JogAxis::Y,
            "Z" => JogAxis::Z,
            "RX" => JogAxis::Rx,
            "RY" => JogAxis::Ry,
            "RZ" => JogAxis::Rz,
            joint => match joint.strip_prefix('J').and_then(|n| n.parse::<u8>().ok()) {
                Some(n @ 1..=6) => JogAxis::Joint(n),
                _ => return Err(invalid()),
            },
        };
        Ok(Self { axis, positive })
    }
}

impl fmt::Display for Jog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.axis {
            JogAxis::Joint(n) => write!(f, "J{}", n)?,
            JogAxis::X => f.write_str("X")?,
            JogAxis::Y => f.write_str("Y")?,
            JogAxis::Z => f.write_str("Z")?,
            JogAxis::Rx => f.write_str("Rx")?,
            JogAxis::Ry => f.write_str("Ry")?,
            JogAxis::Rz => f.write_str("Rz")?,
        }
        f.write_str(if self.positive { "+" } else { "-" })
    }
}

pub(crate) fn check_ratio(what: &str, ratio: u8) -> Result<()> {
    if !(1..=100).contains(&ratio) {
        return Err(DobotError::InvalidCommand(format!("{} ratio {} outside 1..=100", what, ratio)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedChannel;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_request_reads_until_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 64];
            let n = socket.read(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..n], b"EnableRobot()");
            // Reply split across two writes
            socket.write_all(b"0,{},Enable").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            socket.write_all(b"Robot();").await.unwrap();
            socket
        });

        let client = DashboardClient::new("127.0.0.1", Some(port));
        client.connect(Duration::from_secs(1)).await.unwrap();
        let reply = client.request("EnableRobot()").await.unwrap();
        assert_eq!(reply, "0,{},EnableRobot();");

        let _socket = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_control_mode_notice_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 128];
            socket.read(&mut buffer).await.unwrap();
            socket.write_all(b"Control Mode Is Not Tcp").await.unwrap();

            let n = socket.read(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..n], b"ClearError()");
            socket.write_all(b"0,{},ClearError();").await.unwrap();
            socket
        });

        let client = DashboardClient::new("127.0.0.1", Some(port)).with_reply_timeout(Duration::from_secs(2));
        client.connect(Duration::from_secs(1)).await.unwrap();

        let started = std::time::Instant::now();
        let err = client.command("MovJ(pose={1,2,3,4,5,6})").await.unwrap_err();
        assert!(matches!(err, DobotError::WrongControlMode { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(client.is_connected().await);

        client.clear_error().await.unwrap();
        let _socket = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_reply_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 64];
            socket.read(&mut buffer).await.unwrap();
            // Never terminated; the client must give up on size, not on time
            let chunk = vec![b'7'; 8 * 1024];
            for _ in 0..(MAX_REPLY_BYTES / chunk.len() + 2) {
                if socket.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            socket
        });

        let client = DashboardClient::new("127.0.0.1", Some(port)).with_reply_timeout(Duration::from_secs(5));
        client.connect(Duration::from_secs(1)).await.unwrap();

        let err = client.request("GetPose()").await.unwrap_err();
        assert!(matches!(err, DobotError::Protocol(_)));
        assert!(!client.is_connected().await);
        let _socket = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_connection_fails() {
        let client = DashboardClient::new("127.0.0.1", Some(1));
        let err = client.request("Stop()").await.unwrap_err();
        assert!(matches!(err, DobotError::Connection(_)));
    }

    #[tokio::test]
    async fn test_closed_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let client = DashboardClient::new("127.0.0.1", Some(port));
        client.connect(Duration::from_secs(1)).await.unwrap();
        server.await.unwrap();

        let err = client.request("Stop()").await.unwrap_err();
        assert!(matches!(err, DobotError::Connection(_) | DobotError::Io(_)));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_helpers_format_commands() {
        let channel = ScriptedChannel::always("0,{},Ok();");
        channel.enable_robot().await.unwrap();
        channel.speed_factor(30).await.unwrap();
        channel.vel_l(10).await.unwrap();
        channel.set_digital_output(3, true).await.unwrap();

        assert_eq!(
            channel.sent(),
            vec!["EnableRobot()", "SpeedFactor(30)", "VelL(10)", "DO(3,1)"]
        );
    }

    #[tokio::test]
    async fn test_helper_surfaces_rejection() {
        let channel = ScriptedChannel::always("-1,{},ClearError();");
        let err = channel.clear_error().await.unwrap_err();
        assert!(matches!(err, DobotError::Rejected { code: -1, .. }));
    }

    #[tokio::test]
    async fn test_ratio_validation_sends_nothing() {
        let channel = ScriptedChannel::always("0,{},Ok();");
        assert!(channel.speed_factor(0).await.is_err());
        assert!(channel.vel_l(101).await.is_err());
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_jog_and_sensor_commands() {
        let channel = ScriptedChannel::always("0,{},Ok();");
        channel.jog("J3-".parse().unwrap()).await.unwrap();
        channel.jog("rz+".parse().unwrap()).await.unwrap();
        channel.stop_jog().await.unwrap();
        channel.drag_sensitivity(0, 50).await.unwrap();
        channel.enable_force_sensor(true).await.unwrap();
        channel.zero_force_sensor().await.unwrap();

        assert_eq!(
            channel.sent(),
            vec![
                "MoveJog(J3-)",
                "MoveJog(Rz+,coordtype=1,user=0,tool=0)",
                "MoveJog()",
                "DragSensivity(0,50)",
                "EnableFTSensor(1)",
                "SixForceHome()",
            ]
        );
    }

    #[test]
    fn test_jog_parsing() {
        let jog: Jog = "X+".parse().unwrap();
        assert_eq!(jog, Jog { axis: JogAxis::X, positive: true });
        assert_eq!("j6-".parse::<Jog>().unwrap().to_string(), "J6-");
        assert!("J7+".parse::<Jog>().is_err());
        assert!("J0-".parse::<Jog>().is_err());
        assert!("X".parse::<Jog>().is_err());
        assert!("W+".parse::<Jog>().is_err());
    }

    #[tokio::test]
    async fn test_drag_sensitivity_validation_sends_nothing() {
        let channel = ScriptedChannel::always("0,{},Ok();");
        assert!(channel.drag_sensitivity(7, 50).await.is_err());
        assert!(channel.drag_sensitivity(1, 0).await.is_err());
        assert!(channel.drag_sensitivity(1, 91).await.is_err());
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_get_force() {
        let channel = ScriptedChannel::always("0,{1.25,-0.5,9.8,0.01,0.0,-0.02},GetForce();");
        assert_eq!(channel.get_force().await.unwrap(), [1.25, -0.5, 9.8, 0.01, 0.0, -0.02]);

        let short = ScriptedChannel::always("0,{1.0,2.0},GetForce();");
        assert!(matches!(short.get_force().await, Err(DobotError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_get_pose() {
        let channel = ScriptedChannel::always("0,{1.5,2.5,3.5,180.0,0.0,-90.0},GetPose();");
        let pose = channel.get_pose().await.unwrap();
        assert_eq!(pose, [1.5, 2.5, 3.5, 180.0, 0.0, -90.0]);
    }
}
