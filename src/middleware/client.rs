//! Middleware orchestration client
//!
//! HTTP client for the fleet-management middleware gateway: login, action
//! plan requests, plan status polling and compensating resource deletion.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{MiddlewareConfig, MonitorConfig, RuntimeEndpoint};
use crate::error::{Error, Result};
use crate::middleware::monitor::{PlanStatusSource, ReadinessState, ResourceMonitor};

// =============================================================================
// Identity Types
// =============================================================================

/// Opaque bearer token obtained from the gateway login
#[derive(Clone)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the token value
        write!(f, "SessionToken(***)")
    }
}

/// Identifies the task to deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// GUID of the task to be deployed
    pub task_id: String,
    /// GUID of the robot requesting the deployment
    pub robot_id: String,
    /// Request an exclusive lock on the provisioned resources
    pub lock_resource_reuse: bool,
}

/// Identifier of a provisioning record held by the middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanHandle(String);

impl PlanHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Middleware Client
// =============================================================================

/// Client for the middleware gateway API
pub struct MiddlewareClient {
    http: reqwest::Client,
    config: MiddlewareConfig,
    token: Option<SessionToken>,
}

impl MiddlewareClient {
    pub fn new(config: MiddlewareConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: None,
        }
    }

    /// The session token obtained by [`authenticate`](Self::authenticate)
    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    /// Exchange the configured credentials for a session token
    pub async fn authenticate(&mut self) -> Result<SessionToken> {
        info!("Logging into the middleware at {}", self.config.address);
        let url = self.config.build_api_endpoint("Login");
        let body = json!({
            "Id": self.config.user_id,
            "Password": self.config.password,
        });

        let payload: Value = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::AuthenticationFailed(format!("login request failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::AuthenticationFailed(format!("invalid login response: {e}")))?;

        let token = parse_login_response(&payload)?;
        self.token = Some(token.clone());
        Ok(token)
    }

    /// Submit the task descriptor and obtain an action plan handle
    pub async fn request_plan(&self, descriptor: &TaskDescriptor) -> Result<PlanHandle> {
        let token = self.bearer()?;
        info!("Requesting plan for task {}", descriptor.task_id);
        let url = self.config.build_api_endpoint("Task/Plan");
        let body = json!({
            "TaskId": descriptor.task_id,
            "LockResourceReUse": descriptor.lock_resource_reuse,
            "RobotId": descriptor.robot_id,
        });

        let payload: Value = self
            .http
            .post(&url)
            .bearer_auth(token.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::PlanRequestFailed(format!("plan request failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::PlanRequestFailed(format!("invalid plan response: {e}")))?;

        let plan = parse_plan_response(&payload)?;
        info!("Obtained action plan {plan}");
        Ok(plan)
    }

    /// Construct and start the readiness monitor bound to `plan`
    pub fn start_monitor(
        &self,
        plan: &PlanHandle,
        config: MonitorConfig,
        netapp_port: u16,
    ) -> Result<ResourceMonitor> {
        let token = self.bearer()?;
        let poller = PlanStatusPoller {
            http: self.http.clone(),
            url: self.plan_url(plan),
            token: token.clone(),
            netapp_port,
        };
        Ok(ResourceMonitor::spawn(Arc::new(poller), config))
    }

    /// Compensating teardown of the provisioned plan.
    ///
    /// Safe to call multiple times and a no-op when no plan (or no session)
    /// exists; a missing plan on the middleware side counts as success.
    pub async fn delete_resources(&self, plan: Option<&PlanHandle>) -> Result<()> {
        let (Some(token), Some(plan)) = (self.token.as_ref(), plan) else {
            return Ok(());
        };

        let response = self
            .http
            .delete(self.plan_url(plan))
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|e| Error::CleanupFailed(format!("delete request failed: {e}")))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            info!("Released middleware resources for plan {plan}");
            Ok(())
        } else {
            Err(Error::CleanupFailed(format!(
                "middleware answered {status} when deleting plan {plan}"
            )))
        }
    }

    fn plan_url(&self, plan: &PlanHandle) -> String {
        self.config
            .build_api_endpoint(&format!("orchestrate/orchestrate/plan/{plan}"))
    }

    fn bearer(&self) -> Result<&SessionToken> {
        self.token
            .as_ref()
            .ok_or_else(|| Error::AuthenticationFailed("not authenticated with the middleware".into()))
    }
}

// =============================================================================
// Status Polling
// =============================================================================

/// Polls one plan's status endpoint on behalf of the readiness monitor
struct PlanStatusPoller {
    http: reqwest::Client,
    url: String,
    token: SessionToken,
    netapp_port: u16,
}

#[async_trait]
impl PlanStatusSource for PlanStatusPoller {
    async fn plan_status(&self) -> Result<ReadinessState> {
        let payload: Value = self
            .http
            .get(&self.url)
            .bearer_auth(self.token.as_str())
            .send()
            .await
            .map_err(|e| Error::Transport(format!("status request failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("invalid status response: {e}")))?;
        Ok(parse_plan_status(&payload, self.netapp_port))
    }
}

// =============================================================================
// Response Parsing
// =============================================================================

fn parse_login_response(payload: &Value) -> Result<SessionToken> {
    if let Some(errors) = payload.get("errors") {
        return Err(Error::AuthenticationFailed(errors.to_string()));
    }
    match payload.get("token").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => Ok(SessionToken(token.to_string())),
        _ => Err(Error::AuthenticationFailed(
            "response does not contain a valid token".into(),
        )),
    }
}

fn parse_plan_response(payload: &Value) -> Result<PlanHandle> {
    if let Some(code) = payload.get("statusCode").and_then(Value::as_u64) {
        if (400..600).contains(&code) {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            return Err(Error::PlanRequestFailed(format!(
                "response {code}: {message}"
            )));
        }
    }
    match payload.get("ActionPlanId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(PlanHandle(id.to_string())),
        _ => Err(Error::PlanRequestFailed(
            "response does not contain an ActionPlanId".into(),
        )),
    }
}

/// Classify a plan status payload.
///
/// The deployment is described by `actionSequence[0].Services[0]`: status
/// `Active` means the service is reachable at `serviceUrl`, `Failed` is
/// terminal, anything else (including a not-yet-materialized record) is
/// still pending.
fn parse_plan_status(payload: &Value, netapp_port: u16) -> ReadinessState {
    let service = payload
        .get("actionSequence")
        .and_then(Value::as_array)
        .and_then(|steps| steps.first())
        .and_then(|step| step.get("Services"))
        .and_then(Value::as_array)
        .and_then(|services| services.first());

    let Some(service) = service else {
        return ReadinessState::Pending;
    };

    let status = service
        .get("serviceStatus")
        .and_then(Value::as_str)
        .unwrap_or("");

    if status.eq_ignore_ascii_case("active") {
        let endpoint = service
            .get("serviceUrl")
            .and_then(Value::as_str)
            .and_then(|url| RuntimeEndpoint::from_service_url(url, netapp_port));
        match endpoint {
            Some(endpoint) => ReadinessState::Ready(endpoint),
            None => ReadinessState::Failed(
                "service is active but reported no usable serviceUrl".into(),
            ),
        }
    } else if status.eq_ignore_ascii_case("failed") {
        ReadinessState::Failed("middleware reported the service as failed".into())
    } else {
        ReadinessState::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_login_token_extracted() {
        let token = parse_login_response(&json!({"token": "abc"})).unwrap();
        assert_eq!(token.as_str(), "abc");
    }

    #[test]
    fn test_login_error_payload() {
        let err = parse_login_response(&json!({"errors": ["bad password"]})).unwrap_err();
        assert_matches!(err, Error::AuthenticationFailed(m) if m.contains("bad password"));
    }

    #[test]
    fn test_login_invalid_token() {
        assert_matches!(
            parse_login_response(&json!({})),
            Err(Error::AuthenticationFailed(_))
        );
        assert_matches!(
            parse_login_response(&json!({"token": ""})),
            Err(Error::AuthenticationFailed(_))
        );
        assert_matches!(
            parse_login_response(&json!({"token": 42})),
            Err(Error::AuthenticationFailed(_))
        );
    }

    #[test]
    fn test_plan_id_extracted() {
        let plan = parse_plan_response(&json!({"ActionPlanId": "p1"})).unwrap();
        assert_eq!(plan.as_str(), "p1");
    }

    #[test]
    fn test_plan_error_payload() {
        let err =
            parse_plan_response(&json!({"statusCode": 500, "message": "x"})).unwrap_err();
        assert_matches!(err, Error::PlanRequestFailed(m) if m.contains('x'));

        let err =
            parse_plan_response(&json!({"statusCode": 404, "message": "no task"})).unwrap_err();
        assert_matches!(err, Error::PlanRequestFailed(m) if m.contains("no task"));
    }

    #[test]
    fn test_plan_missing_id() {
        assert_matches!(
            parse_plan_response(&json!({"unexpected": true})),
            Err(Error::PlanRequestFailed(_))
        );
    }

    #[test]
    fn test_status_active_yields_endpoint() {
        let payload = json!({
            "actionSequence": [
                {"Services": [{"serviceStatus": "Active", "serviceUrl": "http://localhost:5800"}]}
            ]
        });
        let state = parse_plan_status(&payload, 5896);
        assert_eq!(
            state,
            ReadinessState::Ready(RuntimeEndpoint::new("localhost", 5800))
        );
    }

    #[test]
    fn test_status_active_without_port_uses_default() {
        let payload = json!({
            "actionSequence": [
                {"Services": [{"serviceStatus": "Active", "serviceUrl": "netapp.local"}]}
            ]
        });
        let state = parse_plan_status(&payload, 5896);
        assert_eq!(
            state,
            ReadinessState::Ready(RuntimeEndpoint::new("netapp.local", 5896))
        );
    }

    #[test]
    fn test_status_failed() {
        let payload = json!({
            "actionSequence": [{"Services": [{"serviceStatus": "Failed"}]}]
        });
        assert_matches!(parse_plan_status(&payload, 5896), ReadinessState::Failed(_));
    }

    #[test]
    fn test_status_pending_and_malformed() {
        let payload = json!({
            "actionSequence": [{"Services": [{"serviceStatus": "Initializing"}]}]
        });
        assert_eq!(parse_plan_status(&payload, 5896), ReadinessState::Pending);

        // A record that has not materialized yet is still pending
        assert_eq!(parse_plan_status(&json!({}), 5896), ReadinessState::Pending);
        assert_eq!(
            parse_plan_status(&json!({"actionSequence": []}), 5896),
            ReadinessState::Pending
        );
    }

    #[test]
    fn test_status_active_without_url_is_failed() {
        let payload = json!({
            "actionSequence": [{"Services": [{"serviceStatus": "Active"}]}]
        });
        assert_matches!(parse_plan_status(&payload, 5896), ReadinessState::Failed(_));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = SessionToken("secret".into());
        assert_eq!(format!("{token:?}"), "SessionToken(***)");
    }
}
