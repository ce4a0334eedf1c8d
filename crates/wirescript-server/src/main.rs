//! wirescript robot binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen for a controller on the default address
//! wirescript-robot
//!
//! # Resolve PREPARE script names under ./scripts
//! wirescript-robot --control 0.0.0.0:11642 --script-root ./scripts
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use wirescript_server::{DEFAULT_CONTROL_ADDRESS, Robot, RobotConfig};

/// wirescript robot
#[derive(Parser, Debug)]
#[command(name = "wirescript-robot")]
#[command(about = "Enacts network test scripts on behalf of a test controller")]
#[command(version)]
struct Args {
    /// Address the control listener binds to
    #[arg(short, long, default_value = DEFAULT_CONTROL_ADDRESS)]
    control: String,

    /// Directory that PREPARE script names are resolved against
    #[arg(short, long)]
    script_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("wirescript robot starting");

    let config = RobotConfig { control_address: args.control, script_root: args.script_root };
    let robot = Robot::bind(config).await?;

    tracing::info!("Control listener on {}", robot.local_addr()?);

    robot.run().await?;

    Ok(())
}
