//! Condition evaluation on one interpreter slot.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::alert::AlertDefinition;
use crate::context::AlertContext;
use crate::error::Result;
use crate::pool::InterpreterPool;
use crate::script::EvalRequest;

/// Outcome of a successful condition run.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether the alert's actions should fire.
    pub matched: bool,
    /// The context as the script left it.
    pub context: AlertContext,
}

/// Runs `alert`'s condition against `context` on a free slot of `pool`.
///
/// # Errors
///
/// Returns `WatchError::Script` if the condition faults; see
/// [`evaluate_script`].
pub async fn evaluate(
    pool: &InterpreterPool,
    alert: &AlertDefinition,
    context: AlertContext,
) -> Result<Verdict> {
    evaluate_script(pool, &alert.condition, context).await
}

/// Runs `script` against `context` on a free slot of `pool`.
///
/// The script sees the globals `name`, `started_ts` and `result`; the value
/// of its last expression statement decides the verdict and whatever it
/// leaves in `result` becomes the context's new result. The slot is released
/// before this returns, whether or not the script succeeded.
///
/// # Errors
///
/// Returns `WatchError::Script` if the script faults. There is no verdict in
/// that case: a failing condition never matches.
pub async fn evaluate_script(
    pool: &InterpreterPool,
    script: &Arc<str>,
    context: AlertContext,
) -> Result<Verdict> {
    let mut handle = pool.acquire().await?;
    let slot = handle.slot_id();

    let request = EvalRequest {
        script: Arc::clone(script),
        name: context.name().to_string(),
        started_ts: context.started_ts(),
        result: context.result().clone(),
    };

    let outcome = handle.run(request).await;
    pool.release(handle);

    match outcome {
        Ok(output) => {
            debug!(
                alert = %context.name(),
                slot = ?slot,
                matched = output.verdict,
                "condition evaluated"
            );
            Ok(Verdict {
                matched: output.verdict,
                context: context.with_result(output.result),
            })
        }
        Err(e) => {
            warn!(alert = %context.name(), slot = ?slot, error = %e, "condition failed");
            Err(e)
        }
    }
}
