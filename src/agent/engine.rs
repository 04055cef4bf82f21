//! Agent engine - the turn state machine
//!
//! Tick-driven: each `tick()` advances the machine by at most one step and
//! reports whether anything observable changed. The worker thread calls it
//! in a loop; tests drive it directly for deterministic transcripts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::AbortHandle;

use super::context::{estimate_request, RateLimitNotice, RunContext};
use super::loading::LoadingState;
use super::message::{ChatMessage, Role, StreamingTurn, ToolCall, ToolCallStatus};
use super::store::{StoreError, TranscriptStore};
use crate::limit::bucket::RateLimiter;
use crate::limit::usage::{UsageReport, UsageTracker};
use crate::llm::client::{ModelClient, ProviderStream};
use crate::llm::sse::SseParser;
use crate::llm::tools::ToolExecutor;
use crate::llm::types::{
    ChatRequest, RequestEstimate, StopReason, StreamEvent, WireBlock, WireMessage, WireRole,
};

/// Agent loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No active turn
    Idle,
    /// Request body built, estimate computed
    Composing,
    /// Budget checked and limiter debited; ready to open the stream
    Waiting,
    /// Driving the provider stream
    Streaming,
    /// Executing tool calls one per tick
    DispatchingTools,
    /// Staging the follow-up request carrying tool results
    Continuing,
}

/// Cancellation handle shared with the run controller. Aborting the stream
/// unblocks a worker parked on a chunk read; the flag makes the next tick
/// finalize the cancel.
#[derive(Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
    abort: Arc<Mutex<Option<AbortHandle>>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Release);
        if let Some(handle) = self.abort.lock().expect("abort lock poisoned").as_ref() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::Release);
        *self.abort.lock().expect("abort lock poisoned") = None;
    }

    fn set_abort(&self, handle: AbortHandle) {
        *self.abort.lock().expect("abort lock poisoned") = Some(handle);
    }
}

pub struct AgentEngine<S: TranscriptStore> {
    store: Arc<Mutex<S>>,
    loading: Arc<LoadingState>,
    limiter: Arc<RateLimiter>,
    usage: Arc<UsageTracker>,
    client: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    ctx: RunContext,

    state: AgentState,
    cancel: CancelHandle,

    /// Conversation in wire form; rebuilt from the store when a new user
    /// turn starts, extended in place across tool continuations
    convo: Vec<WireMessage>,
    /// Tool result blocks collected during dispatch, staged for the
    /// continuation request
    pending_results: Vec<WireBlock>,

    request: Option<ChatRequest>,
    estimate: RequestEstimate,

    stream: Option<ProviderStream>,
    parser: SseParser,
    turn: Option<StreamingTurn>,
    /// Store id of the assistant message being streamed into
    streaming_msg_id: Option<String>,
    turn_counter: u64,
}

impl<S: TranscriptStore> AgentEngine<S> {
    pub fn new(
        store: Arc<Mutex<S>>,
        loading: Arc<LoadingState>,
        limiter: Arc<RateLimiter>,
        usage: Arc<UsageTracker>,
        client: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
        ctx: RunContext,
    ) -> Self {
        Self {
            store,
            loading,
            limiter,
            usage,
            client,
            tools,
            ctx,
            state: AgentState::Idle,
            cancel: CancelHandle::default(),
            convo: Vec::new(),
            pending_results: Vec::new(),
            request: None,
            estimate: RequestEstimate::default(),
            stream: None,
            parser: SseParser::new(),
            turn: None,
            streaming_msg_id: None,
            turn_counter: 0,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Handle the run controller uses to cancel from the UI thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stage a user message; picked up on the next Idle tick.
    pub fn submit_query(&self, text: impl Into<String>) {
        self.loading.stage_query(text);
    }

    /// Abandon the in-flight work and return to Idle on the next tick.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether a tick would do anything
    pub fn has_work(&self) -> bool {
        self.state != AgentState::Idle
            || self.loading.has_pending_query()
            || self.cancel.is_cancelled()
    }

    /// Advance the state machine by one step. Returns true when the
    /// transcript or machine state visibly changed.
    pub async fn tick(&mut self) -> bool {
        if self.cancel.is_cancelled() && self.state != AgentState::Streaming {
            return self.finalize_cancel();
        }

        match self.state {
            AgentState::Idle => self.tick_idle(),
            AgentState::Composing => self.tick_composing().await,
            AgentState::Waiting => self.tick_waiting().await,
            AgentState::Streaming => self.tick_streaming().await,
            AgentState::DispatchingTools => self.tick_dispatching(),
            AgentState::Continuing => self.tick_continuing(),
        }
    }

    // ---- Idle -> Composing ----

    fn tick_idle(&mut self) -> bool {
        let Some(query) = self.loading.take_pending_query() else {
            return false;
        };

        // The user message must be durable before we go any further.
        let user_msg = ChatMessage::user(query.clone());
        if let Err(e) = self.append(user_msg) {
            return self.fail_turn(format!("Could not persist your message: {e}"));
        }

        if let Err(e) = self.rebuild_convo() {
            return self.fail_turn(format!("Could not load the transcript: {e}"));
        }
        self.convo.push(WireMessage::user(query));

        self.compose();
        true
    }

    fn compose(&mut self) {
        let request = ChatRequest {
            model: self.ctx.model.clone(),
            system: self.ctx.system_prompt.clone(),
            messages: self.normalized_messages(),
            tools: self.tools.definitions(),
            max_tokens: self.ctx.max_tokens,
        };
        self.estimate = estimate_request(&request);
        self.request = Some(request);
        self.transition(AgentState::Composing);
    }

    /// Providers require alternating roles; adjacent same-role messages
    /// (e.g. back-to-back user turns after a failed turn) are merged.
    fn normalized_messages(&self) -> Vec<WireMessage> {
        let mut out: Vec<WireMessage> = Vec::new();
        for msg in &self.convo {
            match out.last_mut() {
                Some(last) if last.role == msg.role => {
                    last.content.extend(msg.content.iter().cloned())
                }
                _ => out.push(msg.clone()),
            }
        }
        out
    }

    /// Rebuild the wire conversation from the persisted transcript. Only
    /// plain user/assistant text carries over; system notices are local and
    /// tool exchanges belong to turn chains that already concluded.
    fn rebuild_convo(&mut self) -> Result<(), StoreError> {
        let messages = self.list_messages()?;
        self.convo = messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .filter_map(|m| match m.role {
                Role::User => Some(WireMessage::user(m.content.clone())),
                Role::Assistant => Some(WireMessage::assistant(m.content.clone())),
                Role::System | Role::ToolResult => None,
            })
            .collect();
        // The staged query is pushed by the caller; drop the copy the store
        // already gave us if it raced in, keeping the tail single.
        if let Some(last) = self.convo.last() {
            if matches!(last.role, WireRole::User) {
                self.convo.pop();
            }
        }
        Ok(())
    }

    // ---- Composing -> Waiting ----

    async fn tick_composing(&mut self) -> bool {
        // Budget gate first. A park released by a window reset still has to
        // re-run the limiter acquire below; the buckets are independent.
        if !self.usage.check_budget().allowed {
            self.usage.wait_for_budget().await;
            if self.cancel.is_cancelled() {
                return self.finalize_cancel();
            }
        }

        match self.limiter.acquire(self.estimate).await {
            Ok(receipt) => {
                if let Some(kind) = receipt.limited_by {
                    self.ctx.notify_rate_limited(RateLimitNotice {
                        kind,
                        wait_ms: receipt.waited_ms,
                        queue_position: receipt.queue_position,
                    });
                }
                self.transition(AgentState::Waiting);
                true
            }
            Err(e) => {
                self.ctx.notify_rate_limited(RateLimitNotice {
                    kind: e.kind,
                    wait_ms: e.wait_ms,
                    queue_position: 0,
                });
                self.fail_turn(format!("Rate limited: {e}"))
            }
        }
    }

    // ---- Waiting -> Streaming ----

    async fn tick_waiting(&mut self) -> bool {
        let request = self.request.clone().unwrap_or_default();

        match self.client.open_stream(&request).await {
            Ok(stream) => {
                self.cancel.set_abort(stream.abort_handle());
                self.stream = Some(stream);
                self.parser = SseParser::new();
                self.turn = Some(StreamingTurn::new());
                self.turn_counter += 1;

                // Empty assistant message up front so the partial response
                // is observable while streaming.
                let msg = ChatMessage::assistant("");
                let id = msg.id.clone();
                if let Err(e) = self.append(msg) {
                    return self.fail_turn(format!("Could not persist the response: {e}"));
                }
                self.streaming_msg_id = Some(id);
                self.transition(AgentState::Streaming);
                true
            }
            Err(e) => self.fail_turn(format!("Could not reach the model: {e}")),
        }
    }

    // ---- Streaming ----

    async fn tick_streaming(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return self.fail_turn("Stream state lost".to_string());
        };

        match stream.next_chunk().await {
            Some(Ok(chunk)) => {
                let events = self.parser.push(&chunk);
                self.apply_events(events)
            }
            Some(Err(e)) => {
                self.stream = None;
                self.stream_failed(format!("Stream failed: {e}"))
            }
            None => {
                // End of stream, or the abort handle fired.
                self.stream = None;
                if self.cancel.is_cancelled() {
                    return self.finalize_cancel();
                }
                let events = self.parser.finish();
                self.apply_events(events)
            }
        }
    }

    fn apply_events(&mut self, events: Vec<StreamEvent>) -> bool {
        let mut changed = false;
        for event in events {
            changed |= self.apply_event(event);
            if self.state != AgentState::Streaming {
                break;
            }
        }
        changed
    }

    fn apply_event(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::MessageStart { model } => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.model = model;
                }
                false
            }
            StreamEvent::TextDelta { text } => {
                let Some(turn) = self.turn.as_mut() else {
                    return false;
                };
                turn.accumulated_text.push_str(&text);
                let accumulated = turn.accumulated_text.clone();
                if let Some(id) = self.streaming_msg_id.clone() {
                    if let Err(e) = self.update(&id, &accumulated) {
                        return self.fail_turn(format!("Could not persist the response: {e}"));
                    }
                }
                true
            }
            StreamEvent::ToolCallStart { id, name } => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.tool_calls.push(ToolCall::new(id, name));
                }
                true
            }
            StreamEvent::ToolCallArgDelta { id, fragment } => {
                if let Some(call) = self.turn.as_mut().and_then(|t| t.tool_call_mut(&id)) {
                    call.arguments.push_str(&fragment);
                }
                false
            }
            StreamEvent::ToolCallEnd { .. } => false,
            StreamEvent::Usage(usage) => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.merge_usage(usage);
                }
                false
            }
            StreamEvent::MessageStop { stop_reason } => self.finish_stream(stop_reason),
            StreamEvent::Error { kind, message } => {
                self.stream_failed(format!("Stream error ({}): {message}", kind.as_str()))
            }
        }
    }

    /// Finalize a completed stream: report usage, extend the conversation,
    /// and either dispatch tools or end the turn.
    fn finish_stream(&mut self, stop_reason: StopReason) -> bool {
        self.stream = None;
        let Some(mut turn) = self.turn.take() else {
            return self.end_turn();
        };
        turn.is_done = true;
        turn.stop_reason = Some(stop_reason);
        tracing::debug!(
            model = ?turn.model,
            stop = ?turn.stop_reason,
            tool_calls = turn.tool_calls.len(),
            "stream complete"
        );

        if let Some(usage) = turn.usage {
            self.usage
                .report_usage(UsageReport::from_usage(&usage, self.ctx.model.clone()));
            self.limiter.report_actual(usage);
        }

        // Extend the wire conversation with what the assistant produced.
        let mut blocks = Vec::new();
        if !turn.accumulated_text.is_empty() {
            blocks.push(WireBlock::Text(turn.accumulated_text.clone()));
        }
        for call in &turn.tool_calls {
            blocks.push(WireBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.parsed_arguments().unwrap_or(serde_json::json!({})),
            });
        }
        if !blocks.is_empty() {
            self.convo.push(WireMessage {
                role: WireRole::Assistant,
                content: blocks,
            });
        }

        match stop_reason {
            StopReason::ToolUse if !turn.tool_calls.is_empty() => {
                self.loading.set_pending_tools(turn.tool_calls);
                self.pending_results.clear();
                self.streaming_msg_id = None;
                self.transition(AgentState::DispatchingTools);
                true
            }
            StopReason::MaxTokens => {
                let note =
                    ChatMessage::system("Response stopped: maximum output tokens reached.");
                let _ = self.append(note);
                self.end_turn()
            }
            StopReason::Error => {
                self.stream_failed("Provider reported an error stop".to_string())
            }
            _ => self.end_turn(),
        }
    }

    // ---- DispatchingTools ----

    fn tick_dispatching(&mut self) -> bool {
        let Some((_idx, mut call)) = self.loading.current_tool() else {
            // All tools ran; stage the continuation.
            self.loading.stage_continuation(self.turn_counter);
            self.transition(AgentState::Continuing);
            return true;
        };

        // Arguments that fail to parse produce a failed result without
        // invoking the executor.
        let outcome = match call.parsed_arguments() {
            Ok(_) => {
                call.status = ToolCallStatus::Running;
                self.tools.run(&call).map_err(|e| e.to_string())
            }
            Err(e) => Err(format!("invalid tool arguments: {e}")),
        };

        let (content, is_error) = match &outcome {
            Ok(result) => {
                call.status = ToolCallStatus::Complete;
                call.result = Some(result.clone());
                (result.clone(), false)
            }
            Err(error) => {
                call.status = ToolCallStatus::Failed;
                call.error = Some(error.clone());
                (error.clone(), true)
            }
        };

        tracing::debug!(tool = %call.name, is_error, "tool call finished");

        let message = ChatMessage::tool_result(call.id.clone(), content.clone());
        if let Err(e) = self.append(message) {
            return self.fail_turn(format!("Could not persist a tool result: {e}"));
        }
        self.pending_results.push(WireBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content,
            is_error,
        });

        self.loading.advance_tool();
        true
    }

    // ---- Continuing -> Composing ----

    fn tick_continuing(&mut self) -> bool {
        self.loading.take_pending_continuation();
        self.loading.take_pending_tools();

        if !self.pending_results.is_empty() {
            self.convo.push(WireMessage {
                role: WireRole::User,
                content: std::mem::take(&mut self.pending_results),
            });
        }

        self.compose();
        true
    }

    // ---- Terminal paths ----

    fn end_turn(&mut self) -> bool {
        self.stream = None;
        self.turn = None;
        self.streaming_msg_id = None;
        self.request = None;
        self.pending_results.clear();
        self.loading.set_loading(false);
        self.loading.mark_state_changed();
        self.transition(AgentState::Idle);
        true
    }

    /// Recoverable failure: becomes a system-role transcript entry, the
    /// partial assistant content stays, and the machine returns to Idle.
    fn stream_failed(&mut self, text: String) -> bool {
        tracing::warn!("{text}");
        let _ = self.append(ChatMessage::system(text));
        self.end_turn()
    }

    fn fail_turn(&mut self, text: String) -> bool {
        tracing::warn!("turn failed: {text}");
        let _ = self.append(ChatMessage::system(text));
        self.end_turn()
    }

    fn finalize_cancel(&mut self) -> bool {
        let had_partial = self
            .turn
            .as_ref()
            .map(|t| !t.accumulated_text.is_empty())
            .unwrap_or(false);

        self.cancel.clear();
        if self.state == AgentState::Idle {
            // A cancel that raced a finished turn has nothing to undo.
            return false;
        }

        if had_partial || self.state == AgentState::Streaming {
            let _ = self.append(ChatMessage::system(
                "Response cancelled; partial output above is truncated.",
            ));
        }
        self.end_turn()
    }

    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "agent state");
            self.state = next;
        }
    }

    // ---- Store helpers ----

    fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        let store = self
            .store
            .lock()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        store.append_message(message)?;
        drop(store);
        self.loading.mark_state_changed();
        Ok(())
    }

    fn update(&self, id: &str, content: &str) -> Result<(), StoreError> {
        let store = self
            .store
            .lock()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        store.update_message(id, content)?;
        drop(store);
        self.loading.mark_state_changed();
        Ok(())
    }

    fn list_messages(&self) -> Result<Vec<ChatMessage>, StoreError> {
        self.store
            .lock()
            .map_err(|e| StoreError::Write(e.to_string()))?
            .list_messages()
    }
}
