//! Fleet-management middleware integration

pub mod client;
pub mod monitor;

pub use client::{MiddlewareClient, PlanHandle, SessionToken, TaskDescriptor};
pub use monitor::{PlanStatusSource, ReadinessState, ResourceMonitor};
