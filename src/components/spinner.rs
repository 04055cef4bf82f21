//! Spinner frames for the status line

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpinnerStyle {
    #[default]
    Braille,
    BrailleDots,
    Line,
}

impl SpinnerStyle {
    pub fn frames(&self) -> &'static [&'static str] {
        match self {
            SpinnerStyle::Braille => &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"],
            SpinnerStyle::BrailleDots => &["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"],
            SpinnerStyle::Line => &["|", "/", "-", "\\"],
        }
    }

    /// Frame for an externally driven phase counter
    pub fn frame_at(&self, phase: usize) -> &'static str {
        let frames = self.frames();
        frames[phase % frames.len()]
    }

    pub fn frame_duration_ms(&self) -> u64 {
        match self {
            SpinnerStyle::Braille => 80,
            SpinnerStyle::BrailleDots => 100,
            SpinnerStyle::Line => 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_at_wraps_around() {
        let style = SpinnerStyle::Braille;
        let frames = style.frames();
        assert_eq!(style.frame_at(0), frames[0]);
        assert_eq!(style.frame_at(frames.len()), frames[0]);
        assert_eq!(style.frame_at(frames.len() + 3), frames[3]);
    }

    #[test]
    fn all_styles_have_frames() {
        for style in [SpinnerStyle::Braille, SpinnerStyle::BrailleDots, SpinnerStyle::Line] {
            assert!(!style.frames().is_empty());
            assert!(style.frame_duration_ms() > 0);
        }
    }
}
