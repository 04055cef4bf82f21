//! Shared loading state between the UI thread and the agent worker
//!
//! Flags the UI polls every frame are atomics; the staged work (pending
//! query, tool queue) sits behind a mutex held only for short sections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use super::message::ToolCall;

#[derive(Debug, Default)]
struct LoadingInner {
    started_at: Option<Instant>,
    pending_query: Option<String>,
    /// Turn id of a staged continuation, if any
    pending_continuation: Option<u64>,
    pending_tools: Vec<ToolCall>,
    current_tool_idx: usize,
}

/// Snapshot handed to the UI for rendering
#[derive(Debug, Clone, Default)]
pub struct LoadingSnapshot {
    pub is_loading: bool,
    pub elapsed_ms: u64,
    pub current_tool: Option<String>,
    pub pending_tool_count: usize,
    pub spinner_phase: usize,
}

/// Single shared instance per run
#[derive(Default)]
pub struct LoadingState {
    is_loading: AtomicBool,
    state_changed: AtomicBool,
    pending_work: AtomicBool,
    spinner_phase: AtomicUsize,
    inner: Mutex<LoadingInner>,
}

impl LoadingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::Acquire)
    }

    pub fn set_loading(&self, loading: bool) {
        let mut inner = self.lock();
        inner.started_at = loading.then(Instant::now);
        if !loading {
            inner.pending_query = None;
            inner.pending_continuation = None;
            inner.pending_tools.clear();
            inner.current_tool_idx = 0;
        }
        drop(inner);
        self.is_loading.store(loading, Ordering::Release);
    }

    /// Set after any transcript-visible mutation; the UI's reload observes
    /// all writes committed before this store (release/acquire pairing).
    pub fn mark_state_changed(&self) {
        self.state_changed.store(true, Ordering::Release);
    }

    /// Atomic exchange used by the UI to decide a transcript reload
    pub fn consume_state_changed(&self) -> bool {
        self.state_changed.swap(false, Ordering::AcqRel)
    }

    pub fn has_pending_work(&self) -> bool {
        self.pending_work.load(Ordering::Acquire)
    }

    /// Stage a user query for the worker and flip the loading flag so the
    /// UI reflects activity immediately.
    pub fn stage_query(&self, text: impl Into<String>) {
        let mut inner = self.lock();
        inner.pending_query = Some(text.into());
        inner.started_at = Some(Instant::now());
        drop(inner);
        self.is_loading.store(true, Ordering::Release);
        self.pending_work.store(true, Ordering::Release);
    }

    pub fn take_pending_query(&self) -> Option<String> {
        let query = self.lock().pending_query.take();
        if query.is_some() {
            self.pending_work.store(false, Ordering::Release);
        }
        query
    }

    pub fn has_pending_query(&self) -> bool {
        self.lock().pending_query.is_some()
    }

    pub fn stage_continuation(&self, turn_id: u64) {
        self.lock().pending_continuation = Some(turn_id);
        self.pending_work.store(true, Ordering::Release);
    }

    pub fn take_pending_continuation(&self) -> Option<u64> {
        let turn = self.lock().pending_continuation.take();
        if turn.is_some() {
            self.pending_work.store(false, Ordering::Release);
        }
        turn
    }

    pub fn set_pending_tools(&self, tools: Vec<ToolCall>) {
        let mut inner = self.lock();
        inner.pending_tools = tools;
        inner.current_tool_idx = 0;
    }

    /// The next undispatched tool, if any, along with its index
    pub fn current_tool(&self) -> Option<(usize, ToolCall)> {
        let inner = self.lock();
        inner
            .pending_tools
            .get(inner.current_tool_idx)
            .cloned()
            .map(|t| (inner.current_tool_idx, t))
    }

    pub fn advance_tool(&self) {
        self.lock().current_tool_idx += 1;
    }

    pub fn remaining_tools(&self) -> usize {
        let inner = self.lock();
        inner.pending_tools.len().saturating_sub(inner.current_tool_idx)
    }

    /// Drain the staged tools (used when finishing or cancelling a turn)
    pub fn take_pending_tools(&self) -> Vec<ToolCall> {
        let mut inner = self.lock();
        inner.current_tool_idx = 0;
        std::mem::take(&mut inner.pending_tools)
    }

    pub fn advance_spinner(&self) -> usize {
        self.spinner_phase.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> LoadingSnapshot {
        let inner = self.lock();
        LoadingSnapshot {
            is_loading: self.is_loading.load(Ordering::Acquire),
            elapsed_ms: inner
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            current_tool: inner
                .pending_tools
                .get(inner.current_tool_idx)
                .map(|t| t.name.clone()),
            pending_tool_count: inner.pending_tools.len().saturating_sub(inner.current_tool_idx),
            spinner_phase: self.spinner_phase.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoadingInner> {
        self.inner.lock().expect("loading state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_query_flips_flags() {
        let state = LoadingState::new();
        assert!(!state.is_loading());

        state.stage_query("hi");
        assert!(state.is_loading());
        assert!(state.has_pending_work());
        assert_eq!(state.take_pending_query().as_deref(), Some("hi"));
        assert!(!state.has_pending_work());
        assert!(state.take_pending_query().is_none());
    }

    #[test]
    fn state_changed_is_consumed_once() {
        let state = LoadingState::new();
        state.mark_state_changed();
        assert!(state.consume_state_changed());
        assert!(!state.consume_state_changed());
    }

    #[test]
    fn clearing_loading_drops_staged_work() {
        let state = LoadingState::new();
        state.stage_query("hi");
        state.set_pending_tools(vec![ToolCall::new("tu_1", "get_weather")]);
        state.set_loading(false);

        assert!(!state.is_loading());
        assert!(state.take_pending_query().is_none());
        assert_eq!(state.remaining_tools(), 0);
    }

    #[test]
    fn tool_queue_walks_in_order() {
        let state = LoadingState::new();
        state.set_pending_tools(vec![
            ToolCall::new("tu_1", "alpha"),
            ToolCall::new("tu_2", "beta"),
        ]);

        let (idx, tool) = state.current_tool().unwrap();
        assert_eq!((idx, tool.name.as_str()), (0, "alpha"));
        state.advance_tool();

        let (idx, tool) = state.current_tool().unwrap();
        assert_eq!((idx, tool.name.as_str()), (1, "beta"));
        state.advance_tool();
        assert!(state.current_tool().is_none());
    }

    #[test]
    fn snapshot_reflects_current_tool() {
        let state = LoadingState::new();
        state.stage_query("q");
        state.set_pending_tools(vec![ToolCall::new("tu_1", "get_weather")]);

        let snap = state.snapshot();
        assert!(snap.is_loading);
        assert_eq!(snap.current_tool.as_deref(), Some("get_weather"));
        assert_eq!(snap.pending_tool_count, 1);
    }
}
