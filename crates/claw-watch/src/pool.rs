//! Bounded pool of independent script interpreters.
//!
//! Every slot is a dedicated OS thread owning one [`Interpreter`]; slots share
//! nothing but the read-only init script source. Evaluations borrow a slot
//! through [`InterpreterPool::acquire`] and give it back when the returned
//! [`InterpreterHandle`] is released or dropped, so a cancelled evaluation
//! cannot leak its slot.
//!
//! A handle dropped while its slot is still running a script (the caller gave
//! up, e.g. on a cycle timeout) cancels that script: it fails at its next
//! statement and the same worker serves the next job. The number of worker
//! threads never exceeds the pool size. Only a worker that died is replaced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Result, WatchError};
use crate::script::{EvalOutput, EvalRequest, Interpreter};

/// Configuration for the interpreter pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of independent interpreters.
    pub size: usize,
    /// Starlark source run once in every slot at creation. Its public
    /// top-level bindings are visible to every condition script.
    pub init_script: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            init_script: None,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration for `size` slots without an init script.
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            init_script: None,
        }
    }

    /// Sets the init script.
    #[must_use]
    pub fn with_init_script(mut self, source: impl Into<String>) -> Self {
        self.init_script = Some(source.into());
        self
    }
}

struct Job {
    request: EvalRequest,
    cancel: Arc<AtomicBool>,
    reply: oneshot::Sender<Result<EvalOutput>>,
}

/// Sending half of one slot's worker thread.
struct Slot {
    id: usize,
    jobs: mpsc::Sender<Job>,
}

impl Slot {
    /// Starts a worker thread. The returned receiver yields the outcome of
    /// running the init script.
    fn spawn(
        id: usize,
        init_script: Option<Arc<str>>,
        live: &Arc<AtomicUsize>,
    ) -> Result<(Self, mpsc::Receiver<Result<()>>)> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveWorker(Arc::clone(live));
        thread::Builder::new()
            .name(format!("script-slot-{id}"))
            .spawn(move || {
                let _guard = guard;
                worker(id, init_script, &queue, &ready_tx);
            })
            .map_err(|e| WatchError::PoolInit {
                reason: format!("failed to spawn slot {id}: {e}"),
            })?;

        Ok((Self { id, jobs }, ready_rx))
    }
}

/// Counts a worker thread as live until dropped.
struct LiveWorker(Arc<AtomicUsize>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn worker(
    id: usize,
    init_script: Option<Arc<str>>,
    queue: &mpsc::Receiver<Job>,
    ready: &mpsc::SyncSender<Result<()>>,
) {
    let interpreter = Interpreter::new(init_script.as_deref());
    let _ = ready.send(interpreter.as_ref().map(drop).map_err(|e| match e {
        WatchError::PoolInit { reason } => WatchError::PoolInit {
            reason: format!("slot {id}: {reason}"),
        },
        other => WatchError::PoolInit {
            reason: format!("slot {id}: {other}"),
        },
    }));

    while let Ok(job) = queue.recv() {
        let outcome = match &interpreter {
            Ok(interpreter) => interpreter.run(&job.request, &job.cancel),
            Err(e) => Err(WatchError::script(format!("slot {id} unavailable: {e}"))),
        };
        // The caller may have given up already.
        let _ = job.reply.send(outcome);
    }

    debug!(slot = id, "script slot stopped");
}

struct PoolInner {
    free: Mutex<Vec<Slot>>,
    permits: Arc<Semaphore>,
    init_script: Option<Arc<str>>,
    live: Arc<AtomicUsize>,
    size: usize,
}

impl PoolInner {
    fn put_back(&self, slot: Slot) {
        self.free.lock().push(slot);
    }

    fn respawn(&self, id: usize) -> Option<Slot> {
        match Slot::spawn(id, self.init_script.clone(), &self.live) {
            Ok((slot, _ready)) => Some(slot),
            Err(e) => {
                error!(slot = id, error = %e, "failed to replace script slot");
                None
            }
        }
    }
}

/// A fixed-size set of isolated interpreters.
///
/// Cloning is cheap and yields a handle to the same slots.
#[derive(Clone)]
pub struct InterpreterPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for InterpreterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterPool")
            .field("size", &self.inner.size)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

impl InterpreterPool {
    /// Starts every slot and runs the init script in each.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Config` for a zero-sized pool and
    /// `WatchError::PoolInit` if a slot cannot start or its init script
    /// fails.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(WatchError::config("interpreter pool size must be at least 1"));
        }

        let init_script: Option<Arc<str>> = config.init_script.as_deref().map(Arc::from);
        let live = Arc::new(AtomicUsize::new(0));

        let mut slots = Vec::with_capacity(config.size);
        for id in 0..config.size {
            let (slot, ready) = Slot::spawn(id, init_script.clone(), &live)?;
            ready.recv().map_err(|_| WatchError::PoolInit {
                reason: format!("slot {id} exited during startup"),
            })??;
            slots.push(slot);
        }

        info!(
            size = config.size,
            init_script = init_script.is_some(),
            "interpreter pool started"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(slots),
                permits: Arc::new(Semaphore::new(config.size)),
                init_script,
                live,
                size: config.size,
            }),
        })
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Returns the number of slots not currently acquired.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Returns the number of worker threads still running.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Waits for a free slot and takes exclusive use of it.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Script` if the pool has lost its slots.
    pub async fn acquire(&self) -> Result<InterpreterHandle> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| WatchError::script("interpreter pool closed"))?;

        // A permit is only handed out while a slot sits in the free list.
        let slot = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or_else(|| WatchError::script("no interpreter slot available"))?;

        debug!(slot = slot.id, "acquired script slot");

        Ok(InterpreterHandle {
            slot: Some(slot),
            state: SlotState::Idle,
            pool: Arc::clone(&self.inner),
            permit: Some(permit),
        })
    }

    /// Returns a slot to the pool. Equivalent to dropping the handle.
    pub fn release(&self, handle: InterpreterHandle) {
        drop(handle);
    }
}

#[derive(Debug)]
enum SlotState {
    Idle,
    /// A job was sent and its reply not received yet.
    Running(Arc<AtomicBool>),
    /// The worker thread is gone.
    Dead,
}

/// Exclusive use of one pool slot.
pub struct InterpreterHandle {
    slot: Option<Slot>,
    state: SlotState,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for InterpreterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterHandle")
            .field("slot", &self.slot_id())
            .field("state", &self.state)
            .finish()
    }
}

impl InterpreterHandle {
    /// Returns the id of the held slot.
    #[must_use]
    pub fn slot_id(&self) -> Option<usize> {
        self.slot.as_ref().map(|slot| slot.id)
    }

    /// Runs one request on the held slot.
    pub(crate) async fn run(&mut self, request: EvalRequest) -> Result<EvalOutput> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| WatchError::script("interpreter handle already released"))?;
        let id = slot.id;

        let cancel = Arc::new(AtomicBool::new(false));
        let (reply, response) = oneshot::channel();
        let job = Job {
            request,
            cancel: Arc::clone(&cancel),
            reply,
        };
        if slot.jobs.send(job).is_err() {
            self.state = SlotState::Dead;
            return Err(WatchError::script(format!("slot {id} worker is gone")));
        }
        self.state = SlotState::Running(cancel);

        let Ok(outcome) = response.await else {
            self.state = SlotState::Dead;
            return Err(WatchError::script(format!("slot {id} worker stopped mid-run")));
        };
        self.state = SlotState::Idle;
        outcome
    }
}

impl Drop for InterpreterHandle {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        match std::mem::replace(&mut self.state, SlotState::Idle) {
            SlotState::Idle => {
                debug!(slot = slot.id, "released script slot");
                self.pool.put_back(slot);
            }
            SlotState::Running(cancel) => {
                // Nobody waits for this script any more. Its worker stops it
                // at the next statement and then takes the next job.
                warn!(slot = slot.id, "cancelling running script");
                cancel.store(true, Ordering::Release);
                self.pool.put_back(slot);
            }
            SlotState::Dead => {
                warn!(slot = slot.id, "replacing dead script slot");
                let id = slot.id;
                drop(slot);
                if let Some(fresh) = self.pool.respawn(id) {
                    self.pool.put_back(fresh);
                } else if let Some(permit) = self.permit.take() {
                    // Keep permits and free slots in step.
                    permit.forget();
                }
            }
        }

        // The slot must be back in the free list before the permit is.
        drop(self.permit.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::time::Duration;

    fn request(script: &str) -> EvalRequest {
        EvalRequest {
            script: Arc::from(script),
            name: "pool-test".to_string(),
            started_ts: 0,
            result: Value::map(),
        }
    }

    mod config_tests {
        use super::*;

        #[test]
        fn default_config() {
            let config = PoolConfig::default();
            assert_eq!(config.size, 1);
            assert!(config.init_script.is_none());
        }

        #[test]
        fn zero_size_is_rejected() {
            let err = InterpreterPool::new(PoolConfig::new(0)).unwrap_err();
            assert!(matches!(err, WatchError::Config { .. }));
        }

        #[test]
        fn failing_init_script_is_fatal() {
            let config = PoolConfig::new(2).with_init_script("x = [][1]");
            let err = InterpreterPool::new(config).unwrap_err();
            assert!(matches!(err, WatchError::PoolInit { .. }));
        }

        #[test]
        fn init_script_syntax_error_is_fatal() {
            let config = PoolConfig::new(1).with_init_script("def (");
            assert!(InterpreterPool::new(config).is_err());
        }
    }

    mod acquire_tests {
        use super::*;

        #[tokio::test]
        async fn acquire_and_release() {
            let pool = InterpreterPool::new(PoolConfig::new(2)).unwrap();
            assert_eq!(pool.size(), 2);
            assert_eq!(pool.available(), 2);

            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
            assert_ne!(a.slot_id(), b.slot_id());

            pool.release(a);
            assert_eq!(pool.available(), 1);
            drop(b);
            assert_eq!(pool.available(), 2);
        }

        #[tokio::test]
        async fn acquire_waits_for_a_free_slot() {
            let pool = InterpreterPool::new(PoolConfig::new(1)).unwrap();
            let held = pool.acquire().await.unwrap();

            let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
            assert!(waiting.is_err(), "second acquire should block");

            drop(held);
            let next = tokio::time::timeout(Duration::from_secs(5), pool.acquire()).await;
            assert!(next.is_ok());
        }

        #[tokio::test]
        async fn run_returns_verdict() {
            let pool = InterpreterPool::new(PoolConfig::new(1)).unwrap();
            let mut handle = pool.acquire().await.unwrap();

            let out = handle.run(request("1 + 1 == 2")).await.unwrap();
            assert!(out.verdict);
        }

        #[tokio::test]
        async fn slot_returns_after_script_error() {
            let pool = InterpreterPool::new(PoolConfig::new(1)).unwrap();
            {
                let mut handle = pool.acquire().await.unwrap();
                assert!(handle.run(request("nope()")).await.is_err());
            }
            assert_eq!(pool.available(), 1);

            let mut handle = pool.acquire().await.unwrap();
            assert!(handle.run(request("True")).await.unwrap().verdict);
        }

        #[tokio::test]
        async fn cancelled_run_reclaims_slot() {
            let pool = InterpreterPool::new(PoolConfig::new(1)).unwrap();
            let slow = "def spin():\n    x = 0\n    for i in range(3000000):\n        x += i\n    return x > 0\nspin()";

            let cancelled = tokio::time::timeout(Duration::from_millis(1), async {
                let mut handle = pool.acquire().await.unwrap();
                handle.run(request(slow)).await
            })
            .await;
            assert!(cancelled.is_err());
            assert_eq!(pool.available(), 1);

            let mut handle = pool.acquire().await.unwrap();
            let out = tokio::time::timeout(Duration::from_secs(5), handle.run(request("True")))
                .await
                .expect("cancelled slot should answer promptly")
                .unwrap();
            assert!(out.verdict);
        }

        #[tokio::test]
        async fn repeated_timeouts_do_not_add_workers() {
            let pool = InterpreterPool::new(PoolConfig::new(1)).unwrap();
            assert_eq!(pool.live_workers(), 1);
            let endless = "def spin():\n    x = 0\n    for i in range(2000000000):\n        x += i\n    return x\nspin()";

            for _ in 0..8 {
                let timed_out = tokio::time::timeout(Duration::from_millis(10), async {
                    let mut handle = pool.acquire().await.unwrap();
                    handle.run(request(endless)).await
                })
                .await;
                assert!(timed_out.is_err());
            }

            assert_eq!(pool.live_workers(), 1);
            assert_eq!(pool.available(), 1);

            let mut handle = pool.acquire().await.unwrap();
            let out = tokio::time::timeout(Duration::from_secs(5), handle.run(request("True")))
                .await
                .expect("worker should be free again")
                .unwrap();
            assert!(out.verdict);
        }

        #[tokio::test]
        async fn dropping_pool_stops_workers() {
            let pool = InterpreterPool::new(PoolConfig::new(3)).unwrap();
            assert_eq!(pool.live_workers(), 3);
            let live = Arc::clone(&pool.inner.live);

            drop(pool);
            for _ in 0..100 {
                if live.load(Ordering::SeqCst) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(live.load(Ordering::SeqCst), 0);
        }
    }

    mod isolation_tests {
        use super::*;

        #[tokio::test]
        async fn slots_do_not_share_bindings() {
            let pool = InterpreterPool::new(PoolConfig::new(2)).unwrap();

            let mut a = pool.acquire().await.unwrap();
            let mut b = pool.acquire().await.unwrap();
            assert_ne!(a.slot_id(), b.slot_id());

            let (set, read) = tokio::join!(
                a.run(request("secret = 42\nTrue")),
                b.run(request("secret == 42")),
            );
            assert!(set.unwrap().verdict);
            assert!(read.is_err(), "slot B must not see slot A's binding");
        }

        #[tokio::test]
        async fn init_helpers_are_available_in_every_slot() {
            let config = PoolConfig::new(2).with_init_script("THRESHOLD = 10\n");
            let pool = InterpreterPool::new(config).unwrap();

            let mut a = pool.acquire().await.unwrap();
            let mut b = pool.acquire().await.unwrap();
            assert!(a.run(request("THRESHOLD == 10")).await.unwrap().verdict);
            assert!(b.run(request("THRESHOLD == 10")).await.unwrap().verdict);
        }
    }
}
