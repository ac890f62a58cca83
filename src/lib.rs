//! Client library for deploying and talking to network applications
//! (NetApps) through a fleet-management middleware.
//!
//! The crate covers the full lifecycle:
//!
//! ```text
//!   authenticate -> request plan -> watch deployment -> connect -> register
//!        |                                                            |
//!        +------------- compensating deletion on failure ------------+
//! ```
//!
//! - [`middleware`] talks HTTP to the middleware gateway (login, plan
//!   provisioning, status polling, resource deletion)
//! - [`netapp`] owns the realtime dual-channel websocket connection to a
//!   deployed NetApp and its command protocol
//! - [`client`] ties both together behind [`NetAppClient`]
//!
//! Most callers only need the facade:
//!
//! ```no_run
//! use netapp_client::{
//!     ClientConfig, EventHandlers, MiddlewareConfig, NetAppClient, RunTaskMode, TaskDescriptor,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> netapp_client::Result<()> {
//! let handlers = EventHandlers::new()
//!     .on_data("results", |data| println!("results: {data}"));
//! let middleware = MiddlewareConfig {
//!     address: "10.0.0.1".into(),
//!     user_id: "11111111-1111-1111-1111-111111111111".into(),
//!     password: "secret".into(),
//! };
//! let mut client = NetAppClient::new(middleware, ClientConfig::default(), handlers);
//!
//! client.connect_to_middleware().await?;
//! let task = TaskDescriptor {
//!     task_id: "22222222-2222-2222-2222-222222222222".into(),
//!     robot_id: "33333333-3333-3333-3333-333333333333".into(),
//!     lock_resource_reuse: false,
//! };
//! client
//!     .run_task(&task, RunTaskMode::WaitAndRegister, json!({"fps": 15}))
//!     .await?;
//!
//! client.send_data("json", json!({"frame": 1}), None).await?;
//! client.release_resources().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod netapp;

pub use client::{NetAppClient, RunTaskMode};
pub use config::{
    BackpressurePolicy, ClientConfig, ConnectionConfig, MiddlewareConfig, MonitorConfig,
    RuntimeEndpoint, DEFAULT_NETAPP_PORT,
};
pub use error::{Error, Result};
pub use middleware::{MiddlewareClient, PlanHandle, ReadinessState, ResourceMonitor, TaskDescriptor};
pub use netapp::{
    CommandResult, ConnectionManager, ConnectionState, ControlCmdType, ControlCommand,
    EventHandlers,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
