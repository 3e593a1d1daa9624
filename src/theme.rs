//! Terminal colors for CLI output.
//!
//! Colors are off when `--no-color` or `NO_COLOR` is set; every styling
//! method then returns the plain text.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally. Call early in main().
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

fn paint<T: Display + ?Sized>(value: &T, style: impl FnOnce(&T) -> String) -> String {
    if colors_enabled() {
        style(value)
    } else {
        value.to_string()
    }
}

/// Semantic styles for CLI text.
pub trait Themed: Display {
    /// Polygon and task labels (cyan).
    fn label(&self) -> String {
        paint(self, |v| v.cyan().to_string())
    }

    /// Counts (green).
    fn count(&self) -> String {
        paint(self, |v| v.green().to_string())
    }

    /// Secondary text such as worker log lines (dimmed).
    fn muted(&self) -> String {
        paint(self, |v| v.dimmed().to_string())
    }

    /// Warnings (yellow).
    fn warning(&self) -> String {
        paint(self, |v| v.yellow().to_string())
    }

    /// Error headers (bold red).
    fn error_style(&self) -> String {
        paint(self, |v| v.red().bold().to_string())
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for usize {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_when_disabled() {
        disable_colors();
        assert!(!colors_enabled());
        assert_eq!("polygon 0".label(), "polygon 0");
        assert_eq!(12usize.count(), "12");
        assert_eq!(String::from("boom").error_style(), "boom");
    }
}
