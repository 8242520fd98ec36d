//! Error types for the claw-watch crate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading, evaluating or dispatching alerts.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Malformed action or alert definition.
    #[error("decode error: {reason}")]
    Decode {
        /// The reason decoding failed.
        reason: String,
    },

    /// The search backend was unreachable or rejected the query.
    #[error("query failed: {reason}")]
    Query {
        /// The reason the query failed.
        reason: String,
    },

    /// The condition script raised a runtime fault or its slot failed.
    #[error("script error: {reason}")]
    Script {
        /// The reason the script failed.
        reason: String,
    },

    /// The cycle did not finish before its deadline.
    #[error("cycle timed out after {after:?}")]
    Timeout {
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// One or more dispatched actions failed.
    #[error("{0}")]
    Actions(ActionFailures),

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// The reason the configuration is invalid.
        reason: String,
    },

    /// The interpreter pool could not be started.
    #[error("interpreter pool initialization failed: {reason}")]
    PoolInit {
        /// The reason initialization failed.
        reason: String,
    },

    /// The alert file is not valid YAML or has the wrong shape.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl WatchError {
    /// Shorthand for a [`WatchError::Decode`].
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`WatchError::Script`].
    pub fn script(reason: impl Into<String>) -> Self {
        Self::Script {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`WatchError::Query`].
    pub fn query(reason: impl Into<String>) -> Self {
        Self::Query {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`WatchError::Config`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

impl From<serde_yaml::Error> for WatchError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type for claw-watch operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Failure of a single dispatched action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The endpoint answered with a status outside 200..=299.
    #[error("non 2xx response code returned: {status}")]
    Status {
        /// The HTTP status code received.
        status: u16,
    },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request could not be built from the action's fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A chat webhook action ran without a configured endpoint.
    #[error("chat webhook endpoint not configured")]
    WebhookNotConfigured,

    /// A field required at dispatch time was empty.
    #[error("missing required field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: &'static str,
    },
}

impl From<reqwest::Error> for ActionError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
            },
            None if err.is_builder() => Self::InvalidRequest(err.to_string()),
            None => Self::Transport(err.to_string()),
        }
    }
}

/// One failed action in a dispatch, identified by its position and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    /// Position of the action in the alert's action list.
    pub index: usize,
    /// The action's type tag.
    pub kind: &'static str,
    /// What went wrong.
    pub error: ActionError,
}

/// Every action failure of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionFailures(pub Vec<ActionFailure>);

impl ActionFailures {
    /// Returns the number of failed actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no action failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the failures.
    pub fn iter(&self) -> impl Iterator<Item = &ActionFailure> {
        self.0.iter()
    }
}

impl fmt::Display for ActionFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} action(s) failed", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(
                f,
                "{sep}action {} ({}): {}",
                failure.index, failure.kind, failure.error
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for ActionFailures {}
