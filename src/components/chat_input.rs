//! Single-line chat input with cursor editing

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::layout::Rect;
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Frame;

/// Text input for composing queries. Cursor positions are char indices.
pub struct ChatInput {
    buffer: String,
    cursor: usize,
}

impl ChatInput {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            cursor: 0,
        }
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    /// Take the buffer contents and reset the input
    pub fn take(&mut self) -> String {
        self.cursor = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Handle a key event; returns the submitted text on Enter.
    pub fn handle_key(&mut self, key: KeyEvent) -> Option<String> {
        match key.code {
            KeyCode::Enter => {
                if self.is_empty() {
                    return None;
                }
                return Some(self.take());
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.insert_char(c);
            }
            KeyCode::Backspace => self.delete_before(),
            KeyCode::Delete => self.delete_at(),
            KeyCode::Left => self.cursor = self.cursor.saturating_sub(1),
            KeyCode::Right => {
                self.cursor = (self.cursor + 1).min(self.buffer.chars().count());
            }
            KeyCode::Home => self.cursor = 0,
            KeyCode::End => self.cursor = self.buffer.chars().count(),
            _ => {}
        }
        None
    }

    fn insert_char(&mut self, c: char) {
        let pos = char_to_byte_pos(&self.buffer, self.cursor);
        self.buffer.insert(pos, c);
        self.cursor += 1;
    }

    fn delete_before(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let start = char_to_byte_pos(&self.buffer, self.cursor - 1);
        let end = char_to_byte_pos(&self.buffer, self.cursor);
        self.buffer.replace_range(start..end, "");
        self.cursor -= 1;
    }

    fn delete_at(&mut self) {
        if self.cursor >= self.buffer.chars().count() {
            return;
        }
        let start = char_to_byte_pos(&self.buffer, self.cursor);
        let end = char_to_byte_pos(&self.buffer, self.cursor + 1);
        self.buffer.replace_range(start..end, "");
    }

    pub fn render(&self, frame: &mut Frame, area: Rect, enabled: bool) {
        let title = if enabled { " Message " } else { " Message (streaming...) " };
        let block = Block::default().borders(Borders::ALL).title(title);
        let inner = block.inner(area);

        let style = if enabled {
            Style::default()
        } else {
            Style::default().add_modifier(Modifier::DIM)
        };
        let paragraph = Paragraph::new(Line::from(Span::styled(self.buffer.clone(), style)))
            .block(block);
        frame.render_widget(paragraph, area);

        if enabled {
            let cursor_x = inner.x + self.cursor.min(inner.width.saturating_sub(1) as usize) as u16;
            frame.set_cursor_position((cursor_x, inner.y));
        }
    }
}

impl Default for ChatInput {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a char index to a byte offset
fn char_to_byte_pos(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}
