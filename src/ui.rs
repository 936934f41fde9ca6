//! Terminal rendering: replaceable state lines and progress bars,
//! written to stderr so they do not mix with program output.

use std::io::{stderr, Write};

use yansi::Paint;

#[derive(thiserror::Error, Debug)]
pub enum UIError {
    #[error("no UI line with id {0}")]
    LineNotFound(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineId(usize);

/// Vertical-cursor bookkeeping over a block of owned lines, in the
/// style of a build tool's live status area.
pub struct UI {
    /// The current text of each line, by position.
    lines: Vec<String>,
    /// Where the cursor currently is, counted in our lines.
    cursor: usize,
}

fn terminal_width() -> usize {
    terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(80)
}

impl UI {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            cursor: 0,
        }
    }

    fn out(&self, text: &str) {
        let mut lock = stderr().lock();
        lock.write_all(text.as_bytes()).ok();
        lock.flush().ok();
    }

    fn move_cursor_to(&mut self, position: usize) {
        if position < self.cursor {
            self.out(&format!("\x1b[{}A\r", self.cursor - position));
        } else if position > self.cursor {
            self.out(&format!("\x1b[{}B\r", position - self.cursor));
        }
        self.cursor = position;
    }

    /// Append a line and return its handle.
    pub fn add_line(&mut self, text: impl Into<String>) -> LineId {
        let text = text.into();
        self.move_cursor_to(self.lines.len());
        self.out(&format!("{text}\n"));
        self.lines.push(text);
        self.cursor += 1;
        LineId(self.lines.len() - 1)
    }

    /// Rewrite an existing line in place.
    pub fn replace_line(&mut self, id: LineId, text: impl Into<String>) -> Result<(), UIError> {
        let LineId(position) = id;
        if position >= self.lines.len() {
            return Err(UIError::LineNotFound(position));
        }
        let text = text.into();
        let previous_len = self.lines[position].chars().count();
        self.move_cursor_to(position);
        self.out(&format!("{}\r", " ".repeat(previous_len)));
        self.out(&format!("{text}\r"));
        self.lines[position] = text;
        let last = self.lines.len();
        self.move_cursor_to(last);
        Ok(())
    }

    /// A `[####----] done/total (p%)` bar fitted to the terminal.
    pub fn render_progress(label: &str, done: usize, total: usize) -> String {
        let total = total.max(1);
        let done = done.min(total);
        let percent = done * 100 / total;

        let width = terminal_width();
        let fixed = format!(" {done}/{total} ({percent}%)");
        let bar_width = width
            .saturating_sub(label.chars().count() + fixed.chars().count() + 3)
            .clamp(10, 40);
        let filled = bar_width * done / total;
        let bar = format!(
            "[{}{}]",
            "#".repeat(filled).green(),
            "-".repeat(bar_width - filled)
        );
        format!("{label} {bar}{fixed}")
    }

    pub fn progress_line(&mut self, label: &str, total: usize) -> LineId {
        self.add_line(Self::render_progress(label, 0, total))
    }

    pub fn update_progress(
        &mut self,
        id: LineId,
        label: &str,
        done: usize,
        total: usize,
    ) -> Result<(), UIError> {
        self.replace_line(id, Self::render_progress(label, done, total))
    }
}

impl Default for UI {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_render_progress_shape() {
        yansi::disable();
        let line = UI::render_progress("downloading", 3, 4);
        assert!(line.starts_with("downloading ["));
        assert!(line.ends_with(" 3/4 (75%)"));
        let filled = line.matches('#').count();
        let empty = line.matches('-').count();
        assert_eq!(filled, (filled + empty) * 3 / 4);
    }

    #[test]
    fn t_zero_total_does_not_divide_by_zero() {
        yansi::disable();
        let line = UI::render_progress("x", 0, 0);
        assert!(line.contains("0/1"));
    }

    #[test]
    fn t_line_ids() {
        let mut ui = UI::new();
        let a = ui.add_line("first");
        let _b = ui.add_line("second");
        ui.replace_line(a, "first, updated").unwrap();
        assert!(matches!(
            ui.replace_line(LineId(9), "nope"),
            Err(UIError::LineNotFound(9))
        ));
    }
}
