//! Dobot command-line driver
//!
//! Connects to a controller, runs the telemetry feed and performs one action:
//! stream monitoring JSON, run a move to completion, or drive the gripper.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dobotd::json_output::output;
use dobotd::{Config, DashboardExt, Jog, MonitorOutput, MotionCommand, RobotController};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "dobotd")]
#[command(about = "Dobot arm control with live telemetry and vacuum gripper support")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Controller address override
    #[arg(long, global = true)]
    host: Option<String>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print telemetry as JSON lines until Ctrl+C
    Monitor,
    /// Joint-space move to a tool pose
    Movj {
        #[arg(num_args = 6, allow_negative_numbers = true)]
        pose: Vec<f64>,
        #[arg(short, long)]
        velocity: Option<u8>,
        /// Continuous-path blend ratio
        #[arg(long)]
        cp: Option<u8>,
    },
    /// Linear move to a tool pose
    Movl {
        #[arg(num_args = 6, allow_negative_numbers = true)]
        pose: Vec<f64>,
        #[arg(short, long)]
        velocity: Option<u8>,
        #[arg(long)]
        cp: Option<u8>,
        /// Blend radius in mm
        #[arg(short, long)]
        radius: Option<f64>,
    },
    /// Joint-space move to joint angles
    Joint {
        #[arg(num_args = 6, allow_negative_numbers = true)]
        angles: Vec<f64>,
        #[arg(short, long)]
        velocity: Option<u8>,
    },
    /// Jog one axis (J1+..J6-, X+, Rz- ...) for a while, then stop
    Jog {
        axis: Jog,
        #[arg(long, default_value = "500")]
        duration_ms: u64,
    },
    /// Drag-mode sensitivity for an axis (0 for all)
    DragSensitivity { axis: u8, value: u8 },
    /// Enable the force/torque sensor and print readings as JSON
    Force {
        /// Take the current reading as zero first
        #[arg(long)]
        zero: bool,
        #[arg(long, default_value = "1")]
        samples: u32,
        #[arg(long, default_value = "100")]
        interval_ms: u64,
    },
    Enable,
    Disable,
    ClearError,
    Stop,
    /// Set the global speed ratio
    Speed { ratio: u8 },
    /// Clear faults and activate the gripper
    GripperInit,
    Grip {
        /// Maximum vacuum in percent
        #[arg(long, default_value = "60")]
        max: u8,
        /// Minimum vacuum in percent
        #[arg(long, default_value = "20")]
        min: u8,
        #[arg(long, default_value = "3000")]
        timeout_ms: u32,
    },
    Release,
}

impl Args {
    fn config_path(&self) -> (String, bool) {
        match self.config.clone().or_else(|| std::env::var("DOBOTD_CONFIG").ok()) {
            Some(path) => (path, true),
            None => ("config/default_config.yaml".to_string(), false),
        }
    }

    fn load_config(&self) -> Result<Config> {
        let (path, explicit) = self.config_path();
        let mut config = if explicit || Path::new(&path).exists() {
            info!("Using config: {}", path);
            Config::load(&path).with_context(|| format!("Failed to load config {}", path))?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };

        if let Some(host) = &self.host {
            config.robot.host = host.clone();
        }
        Ok(config)
    }
}

fn six(values: &[f64]) -> Result<[f64; 6]> {
    match <[f64; 6]>::try_from(values) {
        Ok(array) => Ok(array),
        Err(_) => bail!("Expected 6 values, got {}", values.len()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    let mut robot = RobotController::connect(config)
        .await
        .context("Failed to connect to controller")?;

    let result = run(&robot, args.command).await;

    robot.shutdown().await.context("Failed during shutdown")?;
    result
}

async fn run(robot: &RobotController, command: Commands) -> Result<()> {
    match command {
        Commands::Monitor => monitor(robot).await,
        Commands::Movj { pose, velocity, cp } => {
            let mut command = MotionCommand::movj(six(&pose)?);
            command.velocity_ratio = velocity;
            command.blend_ratio = cp;
            execute_motion(robot, command).await
        }
        Commands::Movl { pose, velocity, cp, radius } => {
            let mut command = MotionCommand::movl(six(&pose)?);
            command.velocity_ratio = velocity;
            command.blend_ratio = cp;
            command.blend_radius = radius;
            execute_motion(robot, command).await
        }
        Commands::Joint { angles, velocity } => {
            let mut command = MotionCommand::movj_joints(six(&angles)?);
            command.velocity_ratio = velocity;
            execute_motion(robot, command).await
        }
        Commands::Jog { axis, duration_ms } => jog(robot, axis, Duration::from_millis(duration_ms)).await,
        Commands::DragSensitivity { axis, value } => Ok(robot.dashboard().drag_sensitivity(axis, value).await?),
        Commands::Force { zero, samples, interval_ms } => {
            let dashboard = robot.dashboard();
            dashboard.enable_force_sensor(true).await?;
            if zero {
                dashboard.zero_force_sensor().await?;
            }
            for sample in 0..samples {
                if sample > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                output::force(dashboard.get_force().await?);
            }
            Ok(())
        }
        Commands::Enable => Ok(robot.dashboard().enable_robot().await?),
        Commands::Disable => Ok(robot.dashboard().disable_robot().await?),
        Commands::ClearError => Ok(robot.dashboard().clear_error().await?),
        Commands::Stop => Ok(robot.emergency_stop().await?),
        Commands::Speed { ratio } => Ok(robot.dashboard().speed_factor(ratio).await?),
        Commands::GripperInit => {
            let gripper = robot.open_gripper().await?;
            gripper.init().await.inspect_err(output::gripper_error)?;
            Ok(())
        }
        Commands::Grip { max, min, timeout_ms } => {
            let gripper = robot.open_gripper().await?;
            gripper.grip(max, min, timeout_ms).await.inspect_err(output::gripper_error)?;
            Ok(())
        }
        Commands::Release => {
            let gripper = robot.open_gripper().await?;
            gripper.release().await.inspect_err(output::gripper_error)?;
            Ok(())
        }
    }
}

async fn execute_motion(robot: &RobotController, command: MotionCommand) -> Result<()> {
    let text = command.to_command_string();
    let motion = robot.motion();

    robot
        .wait_for_telemetry(Duration::from_secs(5))
        .await
        .context("Feedback stream is silent")?;

    let command_id = match motion.send(&command).await {
        Ok(id) => id,
        Err(e) => {
            output::command_failed(None, &text, &e);
            return Err(e.into());
        }
    };
    output::command_sent(command_id, &text);

    let motion_config = &robot.config().motion;
    let wait = motion.await_completion(command_id, motion_config.poll_interval(), motion_config.completion_timeout());

    tokio::select! {
        result = wait => match result {
            Ok(_) => {
                output::command_completed(command_id);
                Ok(())
            }
            Err(e) => {
                output::command_failed(Some(command_id), &text, &e);
                Err(e.into())
            }
        },
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted, stopping robot");
            robot.emergency_stop().await?;
            bail!("Interrupted while waiting for command {}", command_id)
        }
    }
}

async fn jog(robot: &RobotController, axis: Jog, duration: Duration) -> Result<()> {
    let dashboard = robot.dashboard();
    info!("Jogging {} for {:?}", axis, duration);
    dashboard.jog(axis).await?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping jog"),
    }
    dashboard.stop_jog().await?;
    Ok(())
}

async fn monitor(robot: &RobotController) -> Result<()> {
    let mut monitor_output = MonitorOutput::from_config(&robot.config().publishing);
    let mut snapshots = robot.snapshots();
    info!("Monitoring telemetry, Ctrl+C to stop");

    loop {
        tokio::select! {
            next = snapshots.next() => match next {
                Some(snapshot) => monitor_output.process(&snapshot),
                None => bail!("Telemetry feed stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Monitoring stopped");
                return Ok(());
            }
        }
    }
}
