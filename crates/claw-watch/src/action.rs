//! Actions an alert takes when its condition matches.
//!
//! This module provides the [`Action`] tagged union, its decoding from untyped
//! definitions, and the [`ActionDispatcher`] which executes actions and
//! collects their failures without letting one failing action stop the rest.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::AlertContext;
use crate::error::{ActionError, ActionFailure, ActionFailures, Result, WatchError};
use crate::value::Value;

/// An action that only writes a log record. Useful while developing an
/// alert, before any real notification is wired up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAction {
    /// The message to log.
    #[serde(default)]
    pub message: String,
}

/// A single HTTP request. Any response outside 200..=299 is a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAction {
    /// Upper-case HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Target URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A message posted to the configured chat webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackAction {
    /// Message text. Must be non-empty when dispatched.
    #[serde(default)]
    pub text: String,
}

/// One executable action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write a log record.
    Log(LogAction),
    /// Perform an HTTP request.
    Http(HttpAction),
    /// Post to the chat webhook.
    Slack(SlackAction),
}

impl Action {
    /// Decodes an action from an untyped mapping.
    ///
    /// The `type` field (case-insensitive) selects the variant; the other
    /// fields fill it by name. Fields the variant does not know are ignored.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Decode` if `raw` is not a map, its `type` is not
    /// recognised, or a field is missing or of the wrong type.
    pub fn decode(raw: &Value) -> Result<Self> {
        let Value::Map(map) = raw else {
            return Err(WatchError::decode(format!(
                "action definition is not an object (got {})",
                raw.kind()
            )));
        };

        let kind = match map.get("type") {
            Some(Value::String(kind)) => kind.to_lowercase(),
            Some(other) => {
                return Err(WatchError::decode(format!(
                    "action type must be a string, got {} {other}",
                    other.kind()
                )));
            }
            None => return Err(WatchError::decode("action type is missing")),
        };

        let fields = serde_json::Value::from(raw.clone());
        let invalid = |e: serde_json::Error| WatchError::decode(format!("invalid {kind} action: {e}"));

        match kind.as_str() {
            "log" => serde_json::from_value(fields).map(Self::Log).map_err(invalid),
            "http" => {
                let mut action: HttpAction = serde_json::from_value(fields).map_err(invalid)?;
                action.method = normalize_method(&action.method)?;
                Ok(Self::Http(action))
            }
            "slack" => serde_json::from_value(fields).map(Self::Slack).map_err(invalid),
            other => Err(WatchError::decode(format!("unknown action type: {other:?}"))),
        }
    }

    /// Returns the type tag of this action.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Http(_) => "http",
            Self::Slack(_) => "slack",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(a) => write!(f, "log({:?})", a.message),
            Self::Http(a) => write!(f, "http({} {})", a.method, a.url),
            Self::Slack(_) => write!(f, "slack"),
        }
    }
}

fn normalize_method(method: &str) -> Result<String> {
    let upper = method.to_uppercase();
    Method::from_bytes(upper.as_bytes())
        .map_err(|_| WatchError::decode(format!("invalid http method: {method:?}")))?;
    Ok(upper)
}

/// Configuration the dispatcher needs from the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Chat webhook URL. `None` or empty means chat actions cannot run.
    pub webhook_endpoint: Option<String>,
    /// Timeout for every outbound request.
    pub http_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            webhook_endpoint: None,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    /// Sets the chat webhook endpoint.
    #[must_use]
    pub fn with_webhook_endpoint(mut self, url: impl Into<String>) -> Self {
        self.webhook_endpoint = Some(url.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    text: &'a str,
}

/// The result of one action within a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Position of the action in the alert's action list.
    pub index: usize,
    /// The action's type tag.
    pub kind: &'static str,
    /// Whether it succeeded.
    pub result: std::result::Result<(), ActionError>,
}

/// Results of every action of one dispatch, in action-list order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    outcomes: Vec<ActionOutcome>,
}

impl DispatchReport {
    /// Returns every outcome.
    #[must_use]
    pub fn outcomes(&self) -> &[ActionOutcome] {
        &self.outcomes
    }

    /// Returns the number of actions that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Returns the failed actions.
    #[must_use]
    pub fn failures(&self) -> ActionFailures {
        ActionFailures(
            self.outcomes
                .iter()
                .filter_map(|o| {
                    o.result.as_ref().err().map(|error| ActionFailure {
                        index: o.index,
                        kind: o.kind,
                        error: error.clone(),
                    })
                })
                .collect(),
        )
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Returns the number of successful actions, or every failure.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Actions` if any action failed.
    pub fn into_result(self) -> Result<usize> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(self.succeeded())
        } else {
            Err(WatchError::Actions(failures))
        }
    }
}

/// Executes actions against an alert context.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    client: reqwest::Client,
    webhook_endpoint: Option<String>,
}

impl ActionDispatcher {
    /// Creates a dispatcher with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Config` if the HTTP client cannot be built.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| WatchError::config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            webhook_endpoint: config.webhook_endpoint.filter(|url| !url.is_empty()),
        })
    }

    /// Returns the configured chat webhook endpoint.
    #[must_use]
    pub fn webhook_endpoint(&self) -> Option<&str> {
        self.webhook_endpoint.as_deref()
    }

    /// Executes one action.
    ///
    /// # Errors
    ///
    /// Returns the [`ActionError`] describing why the action failed.
    pub async fn dispatch(
        &self,
        action: &Action,
        context: &AlertContext,
    ) -> std::result::Result<(), ActionError> {
        match action {
            Action::Log(log) => {
                info!(
                    alert = %context.name(),
                    started_ts = context.started_ts(),
                    message = %log.message,
                    "log action"
                );
                Ok(())
            }
            Action::Http(http) => self.send_http(http).await,
            Action::Slack(slack) => self.send_chat(slack).await,
        }
    }

    /// Executes every action concurrently and reports each outcome.
    ///
    /// A failing action never prevents the others from running.
    pub async fn dispatch_all(&self, actions: &[Action], context: &AlertContext) -> DispatchReport {
        let runs = actions.iter().enumerate().map(|(index, action)| async move {
            let result = self.dispatch(action, context).await;
            match &result {
                Ok(()) => debug!(alert = %context.name(), action = index, kind = action.kind(), "action done"),
                Err(e) => warn!(
                    alert = %context.name(),
                    action = index,
                    kind = action.kind(),
                    error = %e,
                    "action failed"
                ),
            }
            ActionOutcome {
                index,
                kind: action.kind(),
                result,
            }
        });

        DispatchReport {
            outcomes: join_all(runs).await,
        }
    }

    async fn send_http(&self, action: &HttpAction) -> std::result::Result<(), ActionError> {
        let method = Method::from_bytes(action.method.as_bytes())
            .map_err(|e| ActionError::InvalidRequest(e.to_string()))?;

        let mut request = self
            .client
            .request(method, &action.url)
            .body(action.body.clone());
        for (name, value) in &action.headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ActionError::Status {
                status: status.as_u16(),
            });
        }

        Ok(())
    }

    // The response status is not checked here, unlike `send_http`.
    async fn send_chat(&self, action: &SlackAction) -> std::result::Result<(), ActionError> {
        let endpoint = self
            .webhook_endpoint()
            .ok_or(ActionError::WebhookNotConfigured)?;

        if action.text.is_empty() {
            return Err(ActionError::MissingField { field: "text" });
        }

        self.client
            .post(endpoint)
            .json(&ChatPayload { text: &action.text })
            .send()
            .await?;

        Ok(())
    }
}
