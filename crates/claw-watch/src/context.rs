//! Per-cycle alert context.
//!
//! An [`AlertContext`] is built at the start of every cycle from the alert's
//! name, the cycle start time and the query result. It is moved into the
//! condition evaluator, which may replace the result with whatever the
//! script left behind, and is then only read by the action dispatcher.

use chrono::{DateTime, Utc};

use crate::value::Value;

/// Information an alert accumulates during one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertContext {
    name: String,
    started_ts: u64,
    result: Value,
}

impl AlertContext {
    /// Creates a context for the cycle of `name` that started at
    /// `started_ts` (unix seconds).
    #[must_use]
    pub fn new(name: impl Into<String>, started_ts: u64, result: Value) -> Self {
        Self {
            name: name.into(),
            started_ts,
            result,
        }
    }

    /// Creates a context whose start timestamp is the current time.
    #[must_use]
    pub fn starting_now(name: impl Into<String>, result: Value) -> Self {
        Self::new(name, unix_now(), result)
    }

    /// Returns the alert name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the cycle start as unix seconds.
    #[must_use]
    pub const fn started_ts(&self) -> u64 {
        self.started_ts
    }

    /// Returns the cycle start as a timestamp.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        i64::try_from(self.started_ts)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_default()
    }

    /// Seconds between the cycle start and `now`, saturating at zero.
    #[must_use]
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from(now.timestamp())
            .unwrap_or(0)
            .saturating_sub(self.started_ts)
    }

    /// Returns the current result.
    #[must_use]
    pub const fn result(&self) -> &Value {
        &self.result
    }

    /// Returns the current result for modification.
    pub fn result_mut(&mut self) -> &mut Value {
        &mut self.result
    }

    /// Replaces the result, keeping name and start time.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    /// Consumes the context, returning its result.
    #[must_use]
    pub fn into_result(self) -> Value {
        self.result
    }
}

/// Current wall clock as unix seconds.
pub(crate) fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn context_accessors() {
        let result = Value::map().with("hits", 3i64);
        let ctx = AlertContext::new("disk-full", 1_700_000_000, result.clone());

        assert_eq!(ctx.name(), "disk-full");
        assert_eq!(ctx.started_ts(), 1_700_000_000);
        assert_eq!(ctx.result(), &result);
        assert_eq!(
            ctx.started_at(),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap()
        );
    }

    #[test]
    fn starting_now_uses_wall_clock() {
        let before = unix_now();
        let ctx = AlertContext::starting_now("a", Value::Null);
        let after = unix_now();

        assert!(ctx.started_ts() >= before && ctx.started_ts() <= after);
    }

    #[test]
    fn elapsed_secs_saturates() {
        let ctx = AlertContext::new("a", 100, Value::Null);

        assert_eq!(ctx.elapsed_secs(Utc.timestamp_opt(160, 0).unwrap()), 60);
        assert_eq!(ctx.elapsed_secs(Utc.timestamp_opt(50, 0).unwrap()), 0);
    }

    #[test]
    fn result_can_be_mutated_and_replaced() {
        let mut ctx = AlertContext::new("a", 0, Value::map());
        if let Value::Map(map) = ctx.result_mut() {
            map.insert("seen".to_string(), Value::from(true));
        }
        assert_eq!(ctx.result().get("seen"), Some(&Value::from(true)));

        let ctx = ctx.with_result(Value::from("replaced"));
        assert_eq!(ctx.name(), "a");
        assert_eq!(ctx.into_result(), Value::from("replaced"));
    }
}
