//! Terminal styling for the run report.
//!
//! Colors are off when `--no-color` is passed or `NO_COLOR` is set; every
//! style then returns the plain text.
//!
//! ```ignore
//! use crate::theme::Themed;
//! eprintln!("Route: '{}'", route.item());
//! ```

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

/// Semantic styles for report output.
pub trait Themed: std::fmt::Display {
    /// Apply `style` when colors are on.
    fn styled<F>(&self, style: F) -> String
    where
        F: FnOnce(&Self) -> String,
    {
        if colors_enabled() {
            style(self)
        } else {
            self.to_string()
        }
    }

    /// Work items (cyan).
    fn item(&self) -> String {
        self.styled(|s| s.cyan().to_string())
    }

    /// Worker names (magenta).
    fn worker(&self) -> String {
        self.styled(|s| s.magenta().to_string())
    }

    /// Errors (red + bold).
    fn error_style(&self) -> String {
        self.styled(|s| s.red().bold().to_string())
    }

    /// Report headers with error emphasis (bold + underline + red).
    fn section_header_error(&self) -> String {
        self.styled(|s| s.bold().underline().red().to_string())
    }

    /// Numbers in summaries (cyan).
    fn count(&self) -> String {
        self.styled(|s| s.cyan().to_string())
    }

    /// Secondary text such as error details.
    fn muted(&self) -> String {
        self.styled(|s| s.dimmed().to_string())
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for f64 {}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_colors() {
        COLORS_ENABLED.store(true, Ordering::Relaxed);
        owo_colors::set_override(true);
    }

    #[test]
    #[serial(colors)]
    fn test_disable_colors() {
        reset_colors();
        assert!(colors_enabled());
        disable_colors();
        assert!(!colors_enabled());
        reset_colors();
    }

    #[test]
    #[serial(colors)]
    fn test_styles_with_colors() {
        reset_colors();
        let colored = "/about".item();
        assert!(colored.contains("\x1b["), "Expected ANSI escape codes");
        assert!(colored.contains("/about"));
        assert!(3.5_f64.count().contains("3.5"));
    }

    #[test]
    #[serial(colors)]
    fn test_styles_without_colors() {
        reset_colors();
        disable_colors();

        let text = "test";
        assert_eq!(text.item(), "test");
        assert_eq!(text.worker(), "test");
        assert_eq!(text.error_style(), "test");
        assert_eq!(text.section_header_error(), "test");
        assert_eq!(text.muted(), "test");
        assert_eq!(4.2_f64.count(), "4.2");

        reset_colors();
    }
}
