//! Resource readiness monitor
//!
//! A cancellable background task bound to one action plan. It polls the
//! middleware for the plan status on a fixed interval and publishes the
//! observed [`ReadinessState`] through a watch cell shared with the
//! foreground context. Pending -> Ready and Pending -> Failed are terminal;
//! the monitor never reverts a terminal state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{MonitorConfig, RuntimeEndpoint};
use crate::error::{Error, Result};

// =============================================================================
// Readiness State
// =============================================================================

/// Deployment state of a provisioned plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// Deployment in progress
    Pending,
    /// The NetApp is reachable at the given endpoint
    Ready(RuntimeEndpoint),
    /// The middleware reported the deployment as failed
    Failed(String),
}

impl ReadinessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadinessState::Pending)
    }
}

// =============================================================================
// Status Source
// =============================================================================

/// One poll of a plan's status endpoint.
///
/// Implemented by the middleware client; tests inject scripted sources.
/// A returned `Err` is a transport-level failure and is treated as
/// transient by the monitor.
#[async_trait]
pub trait PlanStatusSource: Send + Sync {
    async fn plan_status(&self) -> Result<ReadinessState>;
}

// =============================================================================
// Resource Monitor
// =============================================================================

/// Handle to the background polling task
pub struct ResourceMonitor {
    state_rx: watch::Receiver<ReadinessState>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Spawn the polling task. The first poll happens immediately, then once
    /// per `config.poll_interval`.
    pub fn spawn(source: Arc<dyn PlanStatusSource>, config: MonitorConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ReadinessState::Pending);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match source.plan_status().await {
                            Ok(ReadinessState::Ready(endpoint)) => {
                                info!("Plan resources ready at {endpoint}");
                                let _ = state_tx.send(ReadinessState::Ready(endpoint));
                                break;
                            }
                            Ok(ReadinessState::Failed(reason)) => {
                                warn!("Plan deployment failed: {reason}");
                                let _ = state_tx.send(ReadinessState::Failed(reason));
                                break;
                            }
                            Ok(ReadinessState::Pending) => {
                                consecutive_failures = 0;
                            }
                            Err(err) => {
                                // Transient by policy: keep polling unless a
                                // configured bound is exceeded.
                                consecutive_failures += 1;
                                warn!(
                                    "Plan status poll failed ({consecutive_failures}): {err}"
                                );
                                if let Some(max) = config.max_transient_failures {
                                    if consecutive_failures >= max {
                                        let _ = state_tx.send(ReadinessState::Failed(format!(
                                            "status polling failed {max} times in a row: {err}"
                                        )));
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            state_rx,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Non-blocking snapshot of whether the plan is ready
    pub fn is_ready(&self) -> bool {
        matches!(&*self.state_rx.borrow(), ReadinessState::Ready(_))
    }

    /// Snapshot of the current readiness state
    pub fn state(&self) -> ReadinessState {
        self.state_rx.borrow().clone()
    }

    /// The NetApp endpoint extracted from the ready status
    pub fn endpoint(&self) -> Result<RuntimeEndpoint> {
        match &*self.state_rx.borrow() {
            ReadinessState::Ready(endpoint) => Ok(endpoint.clone()),
            ReadinessState::Failed(reason) => Err(Error::ResourceNotReady(reason.clone())),
            ReadinessState::Pending => Err(Error::ResourceNotReady(
                "deployment still in progress".into(),
            )),
        }
    }

    /// Block until the readiness state leaves Pending.
    ///
    /// Fails with `ResourceNotReady` when the terminal state is Failed, when
    /// `timeout` elapses first, or when the monitor is stopped while waiting.
    /// Without a timeout the wait is unbounded.
    pub async fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_for_terminal())
                .await
                .map_err(|_| {
                    Error::ResourceNotReady(format!("readiness not reached within {limit:?}"))
                })?,
            None => self.wait_for_terminal().await,
        }
    }

    async fn wait_for_terminal(&self) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        loop {
            match &*state_rx.borrow_and_update() {
                ReadinessState::Ready(_) => return Ok(()),
                ReadinessState::Failed(reason) => {
                    return Err(Error::ResourceNotReady(reason.clone()))
                }
                ReadinessState::Pending => {}
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::ResourceNotReady("monitor stopped".into()));
                    }
                }
                _ = self.cancel.cancelled() => {
                    return Err(Error::ResourceNotReady("monitor stopped".into()));
                }
            }
        }
    }

    /// Cancel the polling task. Releases any blocked waiter and is safe to
    /// call multiple times.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
