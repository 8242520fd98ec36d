//! Alert definitions and the alert file.
//!
//! An alert file is a YAML sequence of alerts:
//!
//! ```yaml
//! - name: error-spike
//!   interval_secs: 60
//!   search:
//!     index: logstash-*
//!     body: { query: { match: { level: error } } }
//!   condition: |
//!     result["hits"]["total"] > 10
//!   actions:
//!     - type: log
//!       message: error spike
//! ```
//!
//! Everything that can be checked without running the alert is checked at
//! load time: names, script syntax and action decoding.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::action::Action;
use crate::error::{Result, WatchError};
use crate::script;
use crate::search::QuerySpec;
use crate::value::Value;

/// Default time between two cycles of an alert.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// A named unit of query, condition script and actions.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDefinition {
    /// Unique alert name.
    pub name: String,
    /// Seconds between cycles.
    pub interval_secs: u64,
    /// The query to run each cycle.
    pub search: QuerySpec,
    /// Starlark condition script source.
    pub condition: Arc<str>,
    /// Actions to dispatch on a match.
    pub actions: Vec<Action>,
}

impl AlertDefinition {
    /// Maximum allowed length for alert names.
    pub const MAX_NAME_LENGTH: usize = 256;

    /// Creates a new alert definition builder.
    pub fn builder(
        name: impl Into<String>,
        search: QuerySpec,
        condition: impl Into<String>,
    ) -> AlertDefinitionBuilder {
        AlertDefinitionBuilder::new(name, search, condition)
    }

    /// Returns the interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Builder for [`AlertDefinition`] instances.
#[derive(Debug)]
pub struct AlertDefinitionBuilder {
    name: String,
    search: QuerySpec,
    condition: String,
    interval_secs: u64,
    actions: Vec<Action>,
}

impl AlertDefinitionBuilder {
    /// Creates a builder with the default interval and no actions.
    pub fn new(name: impl Into<String>, search: QuerySpec, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            search,
            condition: condition.into(),
            interval_secs: DEFAULT_INTERVAL_SECS,
            actions: Vec::new(),
        }
    }

    /// Sets the interval between cycles.
    #[must_use]
    pub const fn interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Appends an action.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Validates and builds the definition.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Decode` if the name is empty or too long, the
    /// interval is zero, or the condition is empty or does not parse.
    pub fn build(self) -> Result<AlertDefinition> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(WatchError::decode("alert name cannot be empty"));
        }
        if name.len() > AlertDefinition::MAX_NAME_LENGTH {
            return Err(WatchError::decode(format!(
                "alert name exceeds {} characters",
                AlertDefinition::MAX_NAME_LENGTH
            )));
        }

        let invalid = |reason: String| WatchError::decode(format!("alert {name:?}: {reason}"));

        if self.interval_secs == 0 {
            return Err(invalid("interval_secs must be greater than 0".to_string()));
        }
        if self.search.index.trim().is_empty() {
            return Err(invalid("search.index cannot be empty".to_string()));
        }
        if self.condition.trim().is_empty() {
            return Err(invalid("condition cannot be empty".to_string()));
        }
        script::check_syntax(&name, &self.condition)
            .map_err(|e| invalid(format!("condition does not parse: {e}")))?;

        Ok(AlertDefinition {
            name,
            interval_secs: self.interval_secs,
            search: self.search,
            condition: Arc::from(self.condition),
            actions: self.actions,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawAlert {
    name: String,
    #[serde(default = "default_interval")]
    interval_secs: u64,
    search: QuerySpec,
    condition: String,
    #[serde(default)]
    actions: Vec<Value>,
}

const fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl RawAlert {
    fn into_definition(self) -> Result<AlertDefinition> {
        let mut builder = AlertDefinition::builder(&self.name, self.search, self.condition)
            .interval_secs(self.interval_secs);

        for (index, raw) in self.actions.iter().enumerate() {
            let action = Action::decode(raw).map_err(|e| {
                WatchError::decode(format!("alert {:?}: action {index}: {e}", self.name))
            })?;
            builder = builder.action(action);
        }

        builder.build()
    }
}

/// Decodes and validates every alert of a YAML alert file.
///
/// # Errors
///
/// Returns `WatchError::SerializationError` for malformed YAML and
/// `WatchError::Decode` for the first invalid alert or a duplicate name.
pub fn load_alerts(yaml: &str) -> Result<Vec<AlertDefinition>> {
    let raw: Vec<RawAlert> = serde_yaml::from_str(yaml)?;

    let mut seen = HashSet::new();
    let mut alerts = Vec::with_capacity(raw.len());
    for raw_alert in raw {
        let alert = raw_alert.into_definition()?;
        if !seen.insert(alert.name.clone()) {
            return Err(WatchError::decode(format!(
                "duplicate alert name: {:?}",
                alert.name
            )));
        }
        alerts.push(alert);
    }

    Ok(alerts)
}

/// Reads and validates an alert file.
///
/// # Errors
///
/// Returns `WatchError::Config` if the file cannot be read, otherwise as
/// [`load_alerts`].
pub fn load_alerts_file(path: impl AsRef<Path>) -> Result<Vec<AlertDefinition>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        WatchError::config(format!(
            "failed to read alert file '{}': {e}",
            path.display()
        ))
    })?;

    let alerts = load_alerts(&content)?;
    info!(path = %path.display(), count = alerts.len(), "loaded alerts");
    Ok(alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{HttpAction, LogAction};
    use std::io::Write;

    const ALERTS: &str = r#"
- name: error-spike
  interval_secs: 30
  search:
    index: logstash-*
    body:
      query:
        match:
          level: error
  condition: |
    result["hits"]["total"] > 10
  actions:
    - type: log
      message: error spike
    - type: http
      method: post
      url: http://hooks.local/errors
      body: too many errors

- name: quiet
  search:
    index: metrics
  condition: "False"
"#;

    mod builder_tests {
        use super::*;

        #[test]
        fn build_minimal() {
            let alert = AlertDefinition::builder("a", QuerySpec::new("logs"), "True")
                .build()
                .unwrap();

            assert_eq!(alert.name, "a");
            assert_eq!(alert.interval(), Duration::from_secs(DEFAULT_INTERVAL_SECS));
            assert!(alert.actions.is_empty());
        }

        #[test]
        fn empty_name_fails() {
            let err = AlertDefinition::builder("  ", QuerySpec::new("logs"), "True")
                .build()
                .unwrap_err();
            assert!(err.to_string().contains("name cannot be empty"));
        }

        #[test]
        fn long_name_fails() {
            let name = "x".repeat(AlertDefinition::MAX_NAME_LENGTH + 1);
            assert!(AlertDefinition::builder(name, QuerySpec::new("logs"), "True")
                .build()
                .is_err());
        }

        #[test]
        fn zero_interval_fails() {
            let err = AlertDefinition::builder("a", QuerySpec::new("logs"), "True")
                .interval_secs(0)
                .build()
                .unwrap_err();
            assert!(err.to_string().contains("interval_secs"));
        }

        #[test]
        fn empty_index_fails() {
            let err = AlertDefinition::builder("a", QuerySpec::new(""), "True")
                .build()
                .unwrap_err();
            assert!(err.to_string().contains("search.index"));
        }

        #[test]
        fn syntax_error_fails_at_load_time() {
            let err = AlertDefinition::builder("broken", QuerySpec::new("logs"), "result[[[")
                .build()
                .unwrap_err();

            assert!(matches!(err, WatchError::Decode { .. }));
            assert!(err.to_string().contains("broken"));
            assert!(err.to_string().contains("does not parse"));
        }
    }

    mod load_tests {
        use super::*;

        #[test]
        fn load_valid_file() {
            let alerts = load_alerts(ALERTS).unwrap();
            assert_eq!(alerts.len(), 2);

            let spike = &alerts[0];
            assert_eq!(spike.name, "error-spike");
            assert_eq!(spike.interval_secs, 30);
            assert_eq!(spike.search.index, "logstash-*");
            assert_eq!(
                spike.search.body.pointer("query.match.level"),
                Some(&Value::from("error"))
            );
            assert_eq!(
                spike.actions,
                vec![
                    Action::Log(LogAction {
                        message: "error spike".to_string()
                    }),
                    Action::Http(HttpAction {
                        method: "POST".to_string(),
                        url: "http://hooks.local/errors".to_string(),
                        headers: Default::default(),
                        body: "too many errors".to_string(),
                    }),
                ]
            );

            let quiet = &alerts[1];
            assert_eq!(quiet.interval_secs, DEFAULT_INTERVAL_SECS);
            assert!(quiet.actions.is_empty());
        }

        #[test]
        fn unknown_action_type_names_alert_and_action() {
            let yaml = r#"
- name: paging
  search: { index: logs }
  condition: "True"
  actions:
    - type: log
    - type: pager
"#;
            let err = load_alerts(yaml).unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains("paging"), "{msg}");
            assert!(msg.contains("action 1"), "{msg}");
            assert!(msg.contains("pager"), "{msg}");
        }

        #[test]
        fn duplicate_names_are_rejected() {
            let yaml = r#"
- name: twice
  search: { index: logs }
  condition: "True"
- name: twice
  search: { index: logs }
  condition: "False"
"#;
            let err = load_alerts(yaml).unwrap_err();
            assert!(err.to_string().contains("duplicate alert name"));
        }

        #[test]
        fn missing_condition_is_a_yaml_error() {
            let yaml = "- name: a\n  search: { index: logs }\n";
            let err = load_alerts(yaml).unwrap_err();
            assert!(matches!(err, WatchError::SerializationError(_)));
        }

        #[test]
        fn load_from_file() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(ALERTS.as_bytes()).unwrap();

            let alerts = load_alerts_file(file.path()).unwrap();
            assert_eq!(alerts.len(), 2);
        }

        #[test]
        fn tagged_and_non_finite_body_values_decode() {
            let yaml = r#"
- name: tagged
  search:
    index: logs
    body:
      since: !stamp 2024-01-01
      boost: .nan
  condition: "True"
  actions:
    - !pager
      type: log
      message: tagged action
"#;
            let alerts = load_alerts(yaml).unwrap();
            let body = &alerts[0].search.body;

            assert_eq!(body.get("since"), Some(&Value::from("2024-01-01")));
            assert_eq!(body.get("boost"), Some(&Value::from("NaN")));
            assert_eq!(alerts[0].actions[0].kind(), "log");
        }

        #[test]
        fn demo_alerts_load() {
            let alerts = load_alerts(include_str!("../demos/alerts.yml")).unwrap();
            assert_eq!(alerts.len(), 2);
            assert_eq!(alerts[1].actions[0].kind(), "http");
        }

        #[test]
        fn missing_file_is_a_config_error() {
            let err = load_alerts_file("/nonexistent/alerts.yml").unwrap_err();
            assert!(matches!(err, WatchError::Config { .. }));
        }
    }
}
