//! Run controller - owns the agent worker thread and the shared handles
//!
//! The worker runs the engine's tick loop on its own current-thread tokio
//! runtime and sleeps on a condvar when there is nothing to do. The UI
//! thread talks to it only through this controller: staged queries, the
//! cancel handle, the state-changed flag, and the debounced reload policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::engine::{AgentEngine, CancelHandle};
use super::loading::LoadingState;
use super::message::ChatMessage;
use super::store::TranscriptStore;
use crate::error::{HelmsmanError, Result};
use crate::limit::bucket::RateLimiter;
use crate::limit::usage::UsageTracker;

/// Idle wait granularity; a missed wake is recovered within this bound.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Minimum spacing between transcript reloads while a turn is streaming
const RELOAD_INTERVAL: Duration = Duration::from_millis(100);

/// Reload throttle for the UI: at most one reload per 100 ms while the
/// agent is loading, immediate once it goes idle.
#[derive(Debug, Default)]
pub struct ReloadDebounce {
    last_reload: Option<Instant>,
}

impl ReloadDebounce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_reload(&mut self, is_loading: bool) -> bool {
        if !is_loading {
            self.last_reload = Some(Instant::now());
            return true;
        }
        match self.last_reload {
            Some(last) if last.elapsed() < RELOAD_INTERVAL => false,
            _ => {
                self.last_reload = Some(Instant::now());
                true
            }
        }
    }
}

pub struct RunController<S: TranscriptStore + 'static> {
    store: Arc<Mutex<S>>,
    loading: Arc<LoadingState>,
    usage: Arc<UsageTracker>,
    limiter: Arc<RateLimiter>,
    cancel: CancelHandle,
    wake: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<S: TranscriptStore + 'static> RunController<S> {
    /// Clean up ephemeral messages, then start the worker thread.
    pub fn start(
        engine: AgentEngine<S>,
        store: Arc<Mutex<S>>,
        loading: Arc<LoadingState>,
        usage: Arc<UsageTracker>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let removed = store
            .lock()
            .map_err(|e| HelmsmanError::Terminal(e.to_string()))?
            .delete_ephemeral()?;
        if removed > 0 {
            tracing::info!("removed {removed} ephemeral message(s) from a previous session");
        }

        let cancel = engine.cancel_handle();
        let wake = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .enable_io()
            .build()?;

        let worker = {
            let wake = wake.clone();
            let shutdown = shutdown.clone();
            let loading = loading.clone();
            let mut engine = engine;
            std::thread::Builder::new()
                .name("agent-worker".to_string())
                .spawn(move || {
                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        if engine.has_work() {
                            let changed = runtime.block_on(engine.tick());
                            if changed {
                                loading.mark_state_changed();
                            }
                            continue;
                        }

                        if loading.has_pending_work() {
                            // Staged between the engine check and here.
                            continue;
                        }
                        let (flag, cvar) = &*wake;
                        let mut pending = flag.lock().expect("wake lock poisoned");
                        if !*pending {
                            let (guard, _) = cvar
                                .wait_timeout(pending, IDLE_WAIT)
                                .expect("wake lock poisoned");
                            pending = guard;
                        }
                        *pending = false;
                    }
                    tracing::debug!("agent worker exiting");
                })
                .map_err(HelmsmanError::Runtime)?
        };

        Ok(Self {
            store,
            loading,
            usage,
            limiter,
            cancel,
            wake,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Stage a user query and wake the worker.
    pub fn submit_query(&self, text: impl Into<String>) {
        self.loading.stage_query(text);
        self.wake_for_work();
    }

    pub fn wake_for_work(&self) {
        let (flag, cvar) = &*self.wake;
        *flag.lock().expect("wake lock poisoned") = true;
        cvar.notify_one();
    }

    /// Abort the in-flight turn. Releases a budget park too, so a worker
    /// waiting on budget observes the cancel promptly.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.usage.resume();
        self.wake_for_work();
    }

    /// Atomic exchange the UI uses to decide whether to reload
    pub fn consume_state_changed(&self) -> bool {
        self.loading.consume_state_changed()
    }

    pub fn loading(&self) -> &Arc<LoadingState> {
        &self.loading
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Snapshot of the transcript in canonical order
    pub fn transcript_snapshot(&self) -> Result<Vec<ChatMessage>> {
        let store = self
            .store
            .lock()
            .map_err(|e| HelmsmanError::Terminal(e.to_string()))?;
        Ok(store.list_messages()?)
    }

    /// Cancel, wake, join the worker, release parks, close the store.
    pub fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.shutdown.store(true, Ordering::Release);
        self.usage.resume();
        self.wake_for_work();

        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| HelmsmanError::WorkerJoin("worker thread panicked".to_string()))?;
        }

        self.store
            .lock()
            .map_err(|e| HelmsmanError::Terminal(e.to_string()))?
            .close()?;
        Ok(())
    }
}

impl<S: TranscriptStore + 'static> Drop for RunController<S> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.shutdown() {
                tracing::warn!("shutdown on drop failed: {e}");
            }
        }
    }
}
