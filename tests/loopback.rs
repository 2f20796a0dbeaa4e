//! RobotController against a fake controller on loopback sockets

use dobotd::feedback::{offsets, FRAME_LEN, TEST_VALUE_MAGIC};
use dobotd::{Config, DobotError, MotionCommand, RobotController, RobotMode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Robot state the fake feedback port is currently reporting
type SharedState = Arc<Mutex<(RobotMode, u64)>>;

struct FakeController {
    dashboard_port: u16,
    feedback_port: u16,
    state: SharedState,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeController {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn set_state(&self, mode: RobotMode, command_id: u64) {
        *self.state.lock().unwrap() = (mode, command_id);
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.robot.host = "127.0.0.1".to_string();
        config.robot.ports.dashboard = self.dashboard_port;
        config.robot.ports.feedback = self.feedback_port;
        config.feed.read_timeout_ms = 20;
        config.feed.retry_delay_ms = 10;
        config.motion.poll_interval_ms = 5;
        config.motion.completion_timeout_ms = 2000;
        config.gripper.settle_ms = 1;
        config.gripper.tool_port_delay_ms = 0;
        config.gripper.release_hold_ms = 1;
        config
    }
}

fn frame(mode: RobotMode, command_id: u64) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_LEN];
    let mut put = |offset: usize, value: u64| frame[offset..offset + 8].copy_from_slice(&value.to_le_bytes());

    put(offsets::ROBOT_MODE, mode.code());
    put(offsets::TEST_VALUE, TEST_VALUE_MAGIC);
    put(offsets::CURRENT_COMMAND_ID, command_id);
    put(offsets::TOOL_VECTOR_ACTUAL, 300.0f64.to_bits());
    frame[0..2].copy_from_slice(&(FRAME_LEN as u16).to_le_bytes());
    frame
}

fn reply_for(command: &str, state: &SharedState) -> String {
    let name = command.split('(').next().unwrap_or(command);
    match name {
        "MovJ" | "MovL" => {
            *state.lock().unwrap() = (RobotMode::Running, 42);
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                *state.lock().unwrap() = (RobotMode::Enabled, 42);
            });
            format!("0,{{42}},{};", command)
        }
        "ModbusRTUCreate" => format!("0,{{1}},{};", command),
        "GetErrorID" => "0,{[[22],[],[],[],[],[],[]]},GetErrorID();".to_string(),
        _ => format!("0,{{}},{};", command),
    }
}

async fn start_fake_controller() -> FakeController {
    let dashboard = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feedback = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let state: SharedState = Arc::new(Mutex::new((RobotMode::Enabled, 41)));
    let commands = Arc::new(Mutex::new(Vec::new()));

    let controller = FakeController {
        dashboard_port: dashboard.local_addr().unwrap().port(),
        feedback_port: feedback.local_addr().unwrap().port(),
        state: state.clone(),
        commands: commands.clone(),
    };

    {
        let state = state.clone();
        tokio::spawn(async move {
            let (mut socket, _) = dashboard.accept().await.unwrap();
            let mut buffer = vec![0u8; 4096];
            loop {
                let n = match socket.read(&mut buffer).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let command = String::from_utf8_lossy(&buffer[..n]).to_string();
                let reply = reply_for(&command, &state);
                commands.lock().unwrap().push(command);
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
    }

    tokio::spawn(async move {
        let (mut socket, _) = feedback.accept().await.unwrap();
        loop {
            let (mode, id) = *state.lock().unwrap();
            if socket.write_all(&frame(mode, id)).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(8)).await;
        }
    });

    controller
}

#[tokio::test]
async fn test_move_completes_against_live_feed() {
    let fake = start_fake_controller().await;
    let mut robot = RobotController::connect(fake.config()).await.unwrap();

    let first = robot.wait_for_telemetry(Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.robot_mode, RobotMode::Enabled);
    assert_eq!(first.active_command_id, 41);
    assert_eq!(first.tool_pose[0], 300.0);

    let id = robot
        .motion()
        .execute(&MotionCommand::movj([300.0, 0.0, 200.0, 180.0, 0.0, 0.0]).with_velocity(20))
        .await
        .unwrap();
    assert_eq!(id, 42);

    let latest = robot.latest().unwrap();
    assert!(latest.is_command_complete(42));
    assert!(robot.feed_stats().frames_published.load(std::sync::atomic::Ordering::Relaxed) > 1);

    tokio::time::timeout(Duration::from_secs(1), robot.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert!(!robot.is_connected());
}

#[tokio::test]
async fn test_move_times_out_when_robot_never_finishes() {
    let fake = start_fake_controller().await;
    let mut config = fake.config();
    config.motion.completion_timeout_ms = 30;
    let mut robot = RobotController::connect(config).await.unwrap();
    robot.wait_for_telemetry(Duration::from_secs(1)).await.unwrap();

    // The fake only switches to enabled after 50 ms
    let err = robot
        .motion()
        .execute(&MotionCommand::movl([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, DobotError::Timeout { command_id: 42, .. }));

    robot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_mode_queries_alarms() {
    let fake = start_fake_controller().await;
    let mut robot = RobotController::connect(fake.config()).await.unwrap();
    robot.wait_for_telemetry(Duration::from_secs(1)).await.unwrap();

    fake.set_state(RobotMode::Error, 41);

    let mut queried = false;
    for _ in 0..100 {
        if fake.commands().iter().any(|c| c == "GetErrorID()") {
            queried = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(queried);

    // Staying in error mode does not repeat the query
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.commands().iter().filter(|c| *c == "GetErrorID()").count(), 1);

    robot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gripper_over_dashboard_bridge() {
    let fake = start_fake_controller().await;
    let mut robot = RobotController::connect(fake.config()).await.unwrap();

    let gripper = robot.open_gripper().await.unwrap();
    gripper.grip(60, 20, 3000).await.unwrap();

    // Every gripper command reopens; the existing session is reused
    robot.open_gripper().await.unwrap();
    assert_eq!(fake.commands().iter().filter(|c| c.starts_with("ModbusRTUCreate")).count(), 1);

    let writes: Vec<String> = fake
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("SetHoldRegs"))
        .collect();
    assert_eq!(
        writes,
        vec![
            "SetHoldRegs(1,1000,1,{512})",
            "SetHoldRegs(1,1000,1,{768})",
            "SetHoldRegs(1,1001,2,{40,7760})",
            "SetHoldRegs(1,1000,1,{2816})",
        ]
    );

    robot.shutdown().await.unwrap();
    assert!(fake.commands().contains(&"ModbusClose(1)".to_string()));
}
