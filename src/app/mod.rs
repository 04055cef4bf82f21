//! UI thread - event loop, debounced transcript reload, and rendering
//!
//! The render loop never blocks on the provider: it polls input with a
//! short timeout while a turn is loading (to keep the spinner moving) and a
//! long one when idle, reloading the transcript snapshot through the run
//! controller's debounce policy.

use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use ratatui::{Frame, Terminal};

use crate::agent::runner::{ReloadDebounce, RunController};
use crate::agent::store::TranscriptStore;
use crate::components::chat_input::ChatInput;
use crate::components::conversation_viewer::ConversationViewer;
use crate::components::spinner::SpinnerStyle;
use crate::error::{HelmsmanError, Result};

/// Input poll timeout while a turn is streaming
const LOADING_POLL: Duration = Duration::from_millis(16);
/// Input poll timeout when idle
const IDLE_POLL: Duration = Duration::from_millis(250);

pub fn init_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode().map_err(|e| HelmsmanError::Terminal(e.to_string()))?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).map_err(|e| HelmsmanError::Terminal(e.to_string()))?;
    Terminal::new(CrosstermBackend::new(stdout)).map_err(|e| HelmsmanError::Terminal(e.to_string()))
}

pub fn restore_terminal() {
    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen);
}

pub struct App<S: TranscriptStore + 'static> {
    controller: RunController<S>,
    viewer: ConversationViewer,
    input: ChatInput,
    debounce: ReloadDebounce,
    notices: Receiver<String>,
    status_notice: Option<String>,
    spinner_style: SpinnerStyle,
    last_spinner_tick: Instant,
    reload_wanted: bool,
    needs_redraw: bool,
    should_quit: bool,
}

impl<S: TranscriptStore + 'static> App<S> {
    pub fn new(controller: RunController<S>, notices: Receiver<String>) -> Self {
        Self {
            controller,
            viewer: ConversationViewer::new(),
            input: ChatInput::new(),
            debounce: ReloadDebounce::new(),
            notices,
            status_notice: None,
            spinner_style: SpinnerStyle::Braille,
            last_spinner_tick: Instant::now(),
            reload_wanted: true,
            needs_redraw: true,
            should_quit: false,
        }
    }

    pub fn controller_mut(&mut self) -> &mut RunController<S> {
        &mut self.controller
    }

    pub fn run(&mut self, terminal: &mut Terminal<impl Backend>) -> Result<()> {
        while !self.should_quit {
            self.pump_notices();
            self.tick_spinner();
            self.maybe_reload()?;

            let timeout = if self.controller.loading().is_loading() {
                LOADING_POLL
            } else {
                IDLE_POLL
            };
            if event::poll(timeout).map_err(|e| HelmsmanError::Terminal(e.to_string()))? {
                let ev = event::read().map_err(|e| HelmsmanError::Terminal(e.to_string()))?;
                self.handle_event(ev);
                self.needs_redraw = true;
            }

            if self.needs_redraw {
                terminal
                    .draw(|frame| self.render(frame))
                    .map_err(|e| HelmsmanError::Terminal(e.to_string()))?;
                self.needs_redraw = false;
            }
        }

        self.controller.shutdown()
    }

    fn pump_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            tracing::info!("notice: {notice}");
            self.status_notice = Some(notice);
            self.needs_redraw = true;
        }
    }

    fn tick_spinner(&mut self) {
        if !self.controller.loading().is_loading() {
            return;
        }
        let interval = Duration::from_millis(self.spinner_style.frame_duration_ms());
        if self.last_spinner_tick.elapsed() >= interval {
            self.controller.loading().advance_spinner();
            self.last_spinner_tick = Instant::now();
            self.needs_redraw = true;
        }
    }

    /// Reload the transcript snapshot when the worker flagged a change,
    /// throttled while streaming.
    fn maybe_reload(&mut self) -> Result<()> {
        if self.controller.consume_state_changed() {
            self.reload_wanted = true;
        }
        if !self.reload_wanted {
            return Ok(());
        }
        let is_loading = self.controller.loading().is_loading();
        if !self.debounce.should_reload(is_loading) {
            return Ok(());
        }

        let messages = self.controller.transcript_snapshot()?;
        self.viewer.set_messages(messages);
        self.reload_wanted = false;
        self.needs_redraw = true;
        Ok(())
    }

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Key(key) if key.kind != KeyEventKind::Release => self.handle_key(key),
            Event::Resize(..) => {}
            _ => {}
        }
    }

    fn handle_key(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') | KeyCode::Char('q') if ctrl => {
                self.should_quit = true;
            }
            KeyCode::Char('r') if ctrl => {
                // Manual release of a budget pause.
                self.controller.usage().resume();
                self.status_notice = Some("Budget pause released".to_string());
            }
            KeyCode::Esc => {
                if self.controller.loading().is_loading() {
                    self.controller.cancel();
                    self.status_notice = Some("Cancelling...".to_string());
                }
            }
            KeyCode::Up => self.viewer.scroll_up(1),
            KeyCode::Down => self.viewer.scroll_down(1),
            KeyCode::PageUp => self.viewer.scroll_up(10),
            KeyCode::PageDown => self.viewer.scroll_down(10),
            _ => {
                if let Some(text) = self.input.handle_key(key) {
                    if self.controller.loading().is_loading() {
                        // One turn at a time; keep the draft.
                        self.status_notice =
                            Some("Still responding; wait or press Esc to cancel".to_string());
                    } else {
                        self.controller.submit_query(text);
                        self.viewer.scroll_to_bottom();
                        self.status_notice = None;
                    }
                }
            }
        }
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(3),
                Constraint::Length(3),
                Constraint::Length(1),
            ])
            .split(frame.area());

        let snapshot = self.controller.loading().snapshot();
        let spinner_frame = snapshot
            .is_loading
            .then(|| self.spinner_style.frame_at(snapshot.spinner_phase));

        self.viewer.render(frame, chunks[0], spinner_frame);
        self.input.render(frame, chunks[1], !snapshot.is_loading);
        self.render_status(frame, chunks[2], &snapshot);
    }

    fn render_status(
        &self,
        frame: &mut Frame,
        area: ratatui::layout::Rect,
        snapshot: &crate::agent::loading::LoadingSnapshot,
    ) {
        let mut spans: Vec<Span> = Vec::new();

        if snapshot.is_loading {
            let mut activity = format!(
                "{} working {:.1}s",
                self.spinner_style.frame_at(snapshot.spinner_phase),
                snapshot.elapsed_ms as f64 / 1000.0
            );
            if let Some(tool) = &snapshot.current_tool {
                activity.push_str(&format!(" [{tool}]"));
                if snapshot.pending_tool_count > 1 {
                    activity.push_str(&format!(" +{}", snapshot.pending_tool_count - 1));
                }
            }
            spans.push(Span::styled(activity, Style::default().fg(Color::Green)));
            spans.push(Span::raw("  "));
        }

        let stats = self.controller.usage().get_stats();
        spans.push(Span::styled(
            format!(
                "tokens {}in/{}out  ${:.4}  req {}",
                stats.input_tokens, stats.output_tokens, stats.cost_usd, stats.request_count
            ),
            Style::default().add_modifier(Modifier::DIM),
        ));

        if let Some(cost_pct) = self.controller.usage().get_usage_percentages().cost {
            spans.push(Span::styled(
                format!("  budget {cost_pct:.0}%"),
                Style::default().add_modifier(Modifier::DIM),
            ));
        }

        let limiter = self.controller.limiter().get_state();
        if limiter.queue_len > 0 {
            spans.push(Span::styled(
                format!("  rate queue {}", limiter.queue_len),
                Style::default().fg(Color::Yellow),
            ));
        }

        if let Some(notice) = &self.status_notice {
            spans.push(Span::raw("  "));
            spans.push(Span::styled(
                notice.clone(),
                Style::default().fg(Color::Yellow),
            ));
        }

        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ratatui::backend::TestBackend;

    use crate::agent::context::RunContext;
    use crate::agent::engine::AgentEngine;
    use crate::agent::loading::LoadingState;
    use crate::agent::message::ChatMessage;
    use crate::agent::store::MemoryTranscriptStore;
    use crate::limit::bucket::{RateLimitConfig, RateLimiter};
    use crate::limit::usage::{UsageLimits, UsageTracker};
    use crate::llm::mock::MockClient;
    use crate::llm::tools::BuiltinToolExecutor;

    use super::*;

    fn test_app() -> App<MemoryTranscriptStore> {
        let store = Arc::new(Mutex::new(MemoryTranscriptStore::new()));
        store
            .lock()
            .unwrap()
            .append_message(ChatMessage::user("hello there"))
            .unwrap();
        let loading = Arc::new(LoadingState::new());
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let usage = UsageTracker::new(UsageLimits::default());
        let engine = AgentEngine::new(
            store.clone(),
            loading.clone(),
            limiter.clone(),
            usage.clone(),
            Arc::new(MockClient::new()),
            Arc::new(BuiltinToolExecutor::new()),
            RunContext::new("claude-sonnet-4-20250514"),
        );
        let controller = RunController::start(engine, store, loading, usage, limiter).unwrap();
        let (_tx, rx) = crossbeam_channel::unbounded();
        App::new(controller, rx)
    }

    #[test]
    fn renders_transcript_and_chrome() {
        let mut app = test_app();
        app.maybe_reload().unwrap();

        let mut terminal = Terminal::new(TestBackend::new(60, 16)).unwrap();
        terminal.draw(|frame| app.render(frame)).unwrap();

        let buffer = terminal.backend().buffer();
        let rendered: String = buffer.content().iter().map(|cell| cell.symbol()).collect();
        assert!(rendered.contains("Conversation"));
        assert!(rendered.contains("hello there"));
        assert!(rendered.contains("Message"));
        assert!(rendered.contains("req 0"));

        app.controller_mut().shutdown().unwrap();
    }

    #[test]
    fn typed_keys_reach_the_input() {
        let mut app = test_app();
        app.handle_key(KeyEvent::new(KeyCode::Char('h'), KeyModifiers::NONE));
        app.handle_key(KeyEvent::new(KeyCode::Char('i'), KeyModifiers::NONE));
        assert_eq!(app.input.text(), "hi");
        app.controller_mut().shutdown().unwrap();
    }

    #[test]
    fn ctrl_c_quits() {
        let mut app = test_app();
        app.handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
        assert!(app.should_quit);
        app.controller_mut().shutdown().unwrap();
    }
}
