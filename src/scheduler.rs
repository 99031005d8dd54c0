// =============================================================================
// Scheduler
// =============================================================================
//
// Fires one tick per bound instrument roughly every bar close, bounded by a
// worker-pool-sized semaphore so a burst of simultaneous bar closes (e.g. a
// dozen 1m bindings) doesn't spawn unbounded concurrent work. Each binding
// gets its own loop task (one `tokio::spawn` + sleep loop per binding) with
// a private lock guarding against overlap if one tick runs long enough to
// still be in flight when the next is due.
//
// Lifecycle: Idle -> Running -> Draining -> Stopped. Draining refuses new
// dispatches and waits for in-flight ticks up to a deadline before
// force-cancelling them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            0 => State::Idle,
            1 => State::Running,
            2 => State::Draining,
            _ => State::Stopped,
        }
    }
}

pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    state: Arc<AtomicU8>,
    update_interval: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
    quarantines: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Scheduler {
    /// `worker_capacity` bounds concurrent in-flight ticks across all
    /// bindings; `update_interval` is the minimum spacing enforced between
    /// heartbeat ticks regardless of per-binding timeframe.
    pub fn new(worker_capacity: usize, update_interval: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(worker_capacity.max(1))),
            state: Arc::new(AtomicU8::new(State::Idle as u8)),
            update_interval,
            handles: Mutex::new(Vec::new()),
            quarantines: Mutex::new(HashMap::new()),
        }
    }

    /// Default worker capacity: roughly `min(n_bindings, cpu_count * 2)`.
    pub fn default_capacity(n_bindings: usize) -> usize {
        let cpu_budget = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) * 2;
        n_bindings.min(cpu_budget).max(1)
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn start(&self) {
        self.state.store(State::Running as u8, Ordering::SeqCst);
    }

    fn state(&self) -> State {
        State::from(self.state.load(Ordering::SeqCst))
    }

    /// Register a binding's tick loop. `period` is its bar-close interval;
    /// `jitter` is the maximum random delay added to each wait, spreading
    /// load when many bindings share a timeframe.
    ///
    /// Each tick runs inside its own `tokio::spawn`, not because it needs its
    /// own task for concurrency (the semaphore already bounds that), but so a
    /// panic inside `tick` is isolated by the Tokio runtime instead of
    /// unwinding into this loop: a panicking tick quarantines the binding
    /// (further ticks are skipped, with a warning, until `clear_quarantine`
    /// is called) rather than aborting the whole loop task.
    pub async fn spawn_binding<F, Fut>(&self, binding_key: String, period: Duration, jitter: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let state = self.state.clone();
        let binding_lock = Arc::new(Mutex::new(()));
        let quarantined = Arc::new(AtomicBool::new(false));
        self.quarantines.lock().await.insert(binding_key.clone(), quarantined.clone());

        let handle = tokio::spawn(async move {
            loop {
                let wait = period + jitter_delay(jitter);
                tokio::time::sleep(wait).await;

                match State::from(state.load(Ordering::SeqCst)) {
                    State::Draining | State::Stopped => break,
                    State::Idle => continue,
                    State::Running => {}
                }

                if quarantined.load(Ordering::SeqCst) {
                    warn!(binding = %binding_key, "binding is quarantined after a panicking tick, skipping");
                    continue;
                }

                let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                let guard = binding_lock.try_lock();
                match guard {
                    Ok(_g) => match tokio::spawn(tick()).await {
                        Ok(()) => {}
                        Err(join_err) if join_err.is_panic() => {
                            quarantined.store(true, Ordering::SeqCst);
                            warn!(binding = %binding_key, "tick panicked, binding quarantined");
                        }
                        Err(_) => {}
                    },
                    Err(_) => {
                        warn!(binding = %binding_key, "previous tick still in flight, skipping this one");
                    }
                }
                drop(permit);
            }
        });

        self.handles.lock().await.push(handle);
    }

    /// Clear a binding's quarantine flag, letting its loop resume ticking.
    /// No-op if the binding was never quarantined or never registered.
    pub async fn clear_quarantine(&self, binding_key: &str) {
        if let Some(flag) = self.quarantines.lock().await.get(binding_key) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub async fn is_quarantined(&self, binding_key: &str) -> bool {
        self.quarantines.lock().await.get(binding_key).map(|f| f.load(Ordering::SeqCst)).unwrap_or(false)
    }

    /// Transition to Draining (refusing new dispatches), then wait up to
    /// `deadline` for in-flight loops to notice and exit. Any handle still
    /// running after the deadline is force-cancelled.
    pub async fn stop(&self, deadline: Duration) {
        self.state.store(State::Draining as u8, Ordering::SeqCst);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let joined = tokio::time::timeout(deadline, futures_join_all(handles)).await;
        if joined.is_err() {
            warn!("scheduler stop deadline elapsed with tasks still running; they were abandoned");
        }
        self.state.store(State::Stopped as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }
}

fn jitter_delay(max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }
    let fraction: f64 = rand::random::<f64>();
    Duration::from_secs_f64(max_jitter.as_secs_f64() * fraction)
}

/// Small local stand-in for `futures::future::join_all` covering exactly the
/// `Vec<JoinHandle<()>>` case the scheduler needs, avoiding a dependency on
/// the `futures` crate for one call site.
async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
