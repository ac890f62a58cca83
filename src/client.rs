//! Orchestration facade
//!
//! [`NetAppClient`] drives the whole lifecycle in order: authenticate with
//! the middleware, provision an action plan, watch the deployment until the
//! NetApp is reachable, connect the realtime channels and run the
//! registration handshake. Any failure after a plan was provisioned triggers
//! compensating deletion of the middleware resources before the original
//! error is surfaced.

use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{ClientConfig, MiddlewareConfig, RuntimeEndpoint};
use crate::error::{Error, Result};
use crate::middleware::{MiddlewareClient, PlanHandle, ResourceMonitor, TaskDescriptor};
use crate::netapp::{
    CommandResult, ConnectionManager, ConnectionState, ControlCommand, EventHandlers,
};

// =============================================================================
// Run Mode
// =============================================================================

/// How far `run_task` takes the lifecycle.
///
/// Each mode is a strict prefix of the next: `DeployOnly` returns right
/// after the plan is provisioned, `Wait` additionally blocks until the
/// deployment is ready, `WaitAndRegister` additionally connects and
/// registers with the NetApp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunTaskMode {
    DeployOnly,
    Wait,
    WaitAndRegister,
}

impl RunTaskMode {
    fn waits_for_readiness(self) -> bool {
        self >= RunTaskMode::Wait
    }

    fn registers(self) -> bool {
        self >= RunTaskMode::WaitAndRegister
    }
}

// =============================================================================
// NetApp Client
// =============================================================================

/// High-level client tying the middleware and the NetApp connection together
pub struct NetAppClient {
    config: ClientConfig,
    middleware: MiddlewareClient,
    connection: ConnectionManager,
    plan: Option<PlanHandle>,
    monitor: Option<ResourceMonitor>,
}

impl NetAppClient {
    pub fn new(
        middleware_config: MiddlewareConfig,
        config: ClientConfig,
        handlers: EventHandlers,
    ) -> Self {
        let connection = ConnectionManager::new(config.connection.clone(), handlers);
        Self {
            config,
            middleware: MiddlewareClient::new(middleware_config),
            connection,
            plan: None,
            monitor: None,
        }
    }

    /// The plan currently held by this client, if any
    pub fn plan(&self) -> Option<&PlanHandle> {
        self.plan.as_ref()
    }

    /// Snapshot of the NetApp connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Authenticate with the middleware gateway
    pub async fn connect_to_middleware(&mut self) -> Result<()> {
        self.middleware.authenticate().await?;
        Ok(())
    }

    /// Provision `task` and take the lifecycle as far as `mode` asks.
    ///
    /// `init_data` is the payload of the registration handshake and is only
    /// used by [`RunTaskMode::WaitAndRegister`]. When anything fails after a
    /// plan was obtained, the middleware resources are deleted before the
    /// error is returned.
    pub async fn run_task(
        &mut self,
        task: &TaskDescriptor,
        mode: RunTaskMode,
        init_data: Value,
    ) -> Result<()> {
        let plan = self.middleware.request_plan(task).await?;
        self.plan = Some(plan);

        match self.deploy_and_register(mode, init_data).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Task deployment failed, releasing resources: {err}");
                if err.requires_cleanup() {
                    if let Err(cleanup_err) = self.release_resources().await {
                        warn!("Compensating cleanup failed: {cleanup_err}");
                    }
                }
                Err(err)
            }
        }
    }

    async fn deploy_and_register(&mut self, mode: RunTaskMode, init_data: Value) -> Result<()> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            Error::PlanRequestFailed("no plan held by the client".into())
        })?;
        let monitor = self.middleware.start_monitor(
            plan,
            self.config.monitor.clone(),
            self.config.netapp_port,
        )?;
        let monitor = self.monitor.insert(monitor);

        if !mode.waits_for_readiness() {
            info!("Plan {plan} provisioned, not waiting for deployment");
            return Ok(());
        }

        monitor.wait_until_ready(self.config.ready_timeout).await?;
        let endpoint = monitor.endpoint()?;
        info!("Deployment ready at {endpoint}");

        if !mode.registers() {
            return Ok(());
        }
        self.register(&endpoint, init_data, true, self.config.connect_timeout)
            .await
    }

    /// Connect both channels to `endpoint` and run the registration
    /// handshake.
    ///
    /// When this client watches a deployment, the deployment must be ready.
    /// When `wait_until_available` is set, connect attempts are retried once
    /// per second within `wait_timeout`; otherwise the first failure is
    /// returned.
    pub async fn register(
        &self,
        endpoint: &RuntimeEndpoint,
        init_data: Value,
        wait_until_available: bool,
        wait_timeout: Option<Duration>,
    ) -> Result<()> {
        if let Some(monitor) = &self.monitor {
            monitor.endpoint()?;
        }
        self.connection
            .connect(endpoint, wait_until_available, wait_timeout)
            .await?;
        match self.connection.register(init_data).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.connection.disconnect().await;
                Err(err)
            }
        }
    }

    /// Push a named payload on the data channel. Optional metadata is
    /// merged into the payload.
    pub async fn send_data(
        &self,
        event: impl Into<String>,
        payload: Value,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.connection.send_data(event, payload, metadata).await
    }

    /// Send a control command and wait for its result
    pub async fn send_command(&self, command: ControlCommand) -> Result<CommandResult> {
        self.connection.send_command(command).await
    }

    /// Full teardown on normal disconnect: close the NetApp connection, stop
    /// the deployment watch and release the provisioned middleware
    /// resources. Deletion is idempotent; cleanup failures are logged and
    /// never raised.
    pub async fn disconnect(&mut self) {
        if let Err(err) = self.release_resources().await {
            warn!("Resource cleanup on disconnect failed: {err}");
        }
    }

    /// Block until the NetApp connection is closed, locally or by the remote
    pub async fn wait(&self) {
        self.connection.closed().await;
    }

    /// Tear everything down: close the connection, stop the monitor and
    /// delete the provisioned middleware resources.
    pub async fn release_resources(&mut self) -> Result<()> {
        self.connection.disconnect().await;
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        let plan = self.plan.take();
        self.middleware.delete_resources(plan.as_ref()).await
    }

    /// Share the connection manager, e.g. with a task that feeds data
    /// concurrently with a task awaiting [`wait`](Self::wait).
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

// Dropping the client cancels the monitor via its own Drop impl; the
// connection tasks stop when their channels close. Explicit
// release_resources is still required to delete middleware state.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_prefix_relation() {
        assert!(!RunTaskMode::DeployOnly.waits_for_readiness());
        assert!(!RunTaskMode::DeployOnly.registers());
        assert!(RunTaskMode::Wait.waits_for_readiness());
        assert!(!RunTaskMode::Wait.registers());
        assert!(RunTaskMode::WaitAndRegister.waits_for_readiness());
        assert!(RunTaskMode::WaitAndRegister.registers());
    }
}
