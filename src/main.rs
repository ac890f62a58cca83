//! NetApp client CLI
//!
//! Deploys a task through the fleet-management middleware, registers with
//! the resulting network application and prints incoming result events
//! until interrupted. Intended as a reference driver for the library.

use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netapp_client::{
    ClientConfig, EventHandlers, MiddlewareConfig, NetAppClient, Result, RunTaskMode,
    TaskDescriptor,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NetApp client - deploy and talk to a network application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address (host or host:port) of the middleware gateway
    #[arg(long, env = "MIDDLEWARE_ADDRESS")]
    middleware_address: String,

    /// GUID of the middleware user
    #[arg(long, env = "MIDDLEWARE_USER")]
    user_id: String,

    /// Password of the middleware user
    #[arg(long, env = "MIDDLEWARE_PASSWORD")]
    password: String,

    /// GUID of the task to deploy
    #[arg(long, env = "MIDDLEWARE_TASK_ID")]
    task_id: String,

    /// GUID of the requesting robot
    #[arg(long, env = "MIDDLEWARE_ROBOT_ID")]
    robot_id: String,

    /// Request an exclusive lock on the provisioned resources
    #[arg(long, env = "LOCK_RESOURCE_REUSE")]
    lock_resource_reuse: bool,

    /// How far to take the deployment (deploy, wait, register)
    #[arg(long, default_value = "register", value_parser = parse_mode)]
    mode: RunTaskMode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

fn parse_mode(value: &str) -> std::result::Result<RunTaskMode, String> {
    match value {
        "deploy" => Ok(RunTaskMode::DeployOnly),
        "wait" => Ok(RunTaskMode::Wait),
        "register" => Ok(RunTaskMode::WaitAndRegister),
        other => Err(format!(
            "unknown mode {other:?}, expected deploy, wait or register"
        )),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting NetApp client");
    info!("  Version: {}", netapp_client::VERSION);
    info!("  Middleware: {}", args.middleware_address);
    info!("  Task: {}", args.task_id);

    let middleware = MiddlewareConfig {
        address: args.middleware_address.clone(),
        user_id: args.user_id.clone(),
        password: args.password.clone(),
    };
    let handlers = EventHandlers::new()
        .on_connect(|| info!("Connection to the network application established"))
        .on_disconnect(|| info!("Connection to the network application closed"))
        .on_connect_error(|reason| error!("Connection failed: {reason}"))
        .on_data("results", |data| info!("Received results: {data}"))
        .on_data("json_error", |data| warn!("NetApp rejected payload: {data}"));

    let mut client = NetAppClient::new(middleware, ClientConfig::default(), handlers);

    client.connect_to_middleware().await?;

    let task = TaskDescriptor {
        task_id: args.task_id.clone(),
        robot_id: args.robot_id.clone(),
        lock_resource_reuse: args.lock_resource_reuse,
    };
    client.run_task(&task, args.mode, json!({})).await?;

    if args.mode != RunTaskMode::WaitAndRegister {
        // Leave the deployment provisioned for other consumers
        if let Some(plan) = client.plan() {
            info!("Plan {plan} provisioned, exiting without a connection");
        }
        return Ok(());
    }

    // Run until the connection drops or the user interrupts
    tokio::select! {
        _ = client.wait() => info!("Connection closed, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    client.release_resources().await?;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap())
        .add_directive("tungstenite=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
