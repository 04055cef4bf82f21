//! Conversation viewer - role-styled transcript rendering with scroll

use ratatui::layout::Rect;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Frame;

use crate::agent::message::{ChatMessage, Role};

pub struct ConversationViewer {
    messages: Vec<ChatMessage>,
    /// Scroll offset in wrapped display lines from the top
    scroll_offset: usize,
    /// Stick to the bottom while new content streams in
    auto_scroll: bool,
}

impl ConversationViewer {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            scroll_offset: 0,
            auto_scroll: true,
        }
    }

    /// Replace the transcript snapshot
    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(lines);
        self.auto_scroll = false;
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll_offset += lines;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.auto_scroll = true;
    }

    pub fn render(&mut self, frame: &mut Frame, area: Rect, streaming_frame: Option<&str>) {
        let block = Block::default().borders(Borders::ALL).title(" Conversation ");
        let inner = block.inner(area);
        let width = inner.width.max(1) as usize;

        let mut lines: Vec<Line> = Vec::new();
        for message in &self.messages {
            let (label, label_style, body_style) = match message.role {
                Role::User => (
                    "you",
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                    Style::default(),
                ),
                Role::Assistant => (
                    "assistant",
                    Style::default()
                        .fg(Color::Green)
                        .add_modifier(Modifier::BOLD),
                    Style::default(),
                ),
                Role::System => (
                    "system",
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::DIM),
                    Style::default().add_modifier(Modifier::DIM),
                ),
                Role::ToolResult => (
                    "tool",
                    Style::default()
                        .fg(Color::Magenta)
                        .add_modifier(Modifier::DIM),
                    Style::default().add_modifier(Modifier::DIM),
                ),
            };

            lines.push(Line::from(Span::styled(format!("{label}:"), label_style)));
            for row in wrap_text(&message.content, width) {
                lines.push(Line::from(Span::styled(row, body_style)));
            }
            lines.push(Line::default());
        }

        if let Some(spinner) = streaming_frame {
            lines.push(Line::from(Span::styled(
                format!("{spinner} thinking..."),
                Style::default().fg(Color::Green),
            )));
        }

        let total = lines.len();
        let visible = inner.height as usize;
        let max_offset = total.saturating_sub(visible);
        if self.auto_scroll || self.scroll_offset > max_offset {
            self.scroll_offset = max_offset;
        }
        if self.scroll_offset == max_offset {
            self.auto_scroll = true;
        }

        let paragraph = Paragraph::new(lines)
            .block(block)
            .scroll((self.scroll_offset as u16, 0));
        frame.render_widget(paragraph, area);
    }
}

impl Default for ConversationViewer {
    fn default() -> Self {
        Self::new()
    }
}

/// Greedy character wrap; enough for transcript display without pulling in
/// a text-layout dependency.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut rows = Vec::new();
    for source_line in text.split('\n') {
        if source_line.is_empty() {
            rows.push(String::new());
            continue;
        }
        let chars: Vec<char> = source_line.chars().collect();
        for chunk in chars.chunks(width.max(1)) {
            rows.push(chunk.iter().collect());
        }
    }
    if rows.is_empty() {
        rows.push(String::new());
    }
    rows
}
