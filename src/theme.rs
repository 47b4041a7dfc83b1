//! Color theming for reports and diagnostics.
//!
//! Colors can be disabled globally with `--no-color` or the `NO_COLOR`
//! environment variable; every helper here then returns unstyled output.

use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors, for both owo_colors output and comfy_table cells.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Semantic color categories used in report tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    /// Healthy outcome or counter
    Good,
    /// Failed outcome, failed worker
    Bad,
    /// Non-fatal trouble: late frames, overdue renders
    Warn,
    /// Byte offsets, keys, masks
    Number,
    Muted,
}

/// comfy_table color for a category, `None` when colors are disabled.
pub fn table_color(semantic: Semantic) -> Option<comfy_table::Color> {
    if !colors_enabled() {
        return None;
    }
    Some(match semantic {
        Semantic::Good => comfy_table::Color::Green,
        Semantic::Bad => comfy_table::Color::Red,
        Semantic::Warn => comfy_table::Color::Yellow,
        Semantic::Number => comfy_table::Color::Cyan,
        Semantic::Muted => comfy_table::Color::DarkGrey,
    })
}

pub trait ThemedCell {
    fn themed(self, semantic: Semantic) -> Self;
}

impl ThemedCell for comfy_table::Cell {
    fn themed(self, semantic: Semantic) -> Self {
        match table_color(semantic) {
            Some(color) => self.fg(color),
            None => self,
        }
    }
}

/// Semantic text styles. All of them respect [`disable_colors`].
pub trait Themed: owo_colors::OwoColorize {
    /// Red and bold.
    fn error_style(&self) -> String
    where
        Self: std::fmt::Display,
    {
        if colors_enabled() {
            format!(
                "{}",
                owo_colors::OwoColorize::bold(&owo_colors::OwoColorize::red(self))
            )
        } else {
            self.to_string()
        }
    }

    fn warning(&self) -> String
    where
        Self: std::fmt::Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::yellow(self))
        } else {
            self.to_string()
        }
    }

    /// Green and bold.
    fn success(&self) -> String
    where
        Self: std::fmt::Display,
    {
        if colors_enabled() {
            format!(
                "{}",
                owo_colors::OwoColorize::bold(&owo_colors::OwoColorize::green(self))
            )
        } else {
            self.to_string()
        }
    }

    fn section_header(&self) -> String
    where
        Self: std::fmt::Display,
    {
        if colors_enabled() {
            format!(
                "{}",
                owo_colors::OwoColorize::underline(&owo_colors::OwoColorize::bold(self))
            )
        } else {
            self.to_string()
        }
    }

    fn label(&self) -> String
    where
        Self: std::fmt::Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::yellow(self))
        } else {
            self.to_string()
        }
    }

    fn count(&self) -> String
    where
        Self: std::fmt::Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::cyan(self))
        } else {
            self.to_string()
        }
    }

    fn muted(&self) -> String
    where
        Self: std::fmt::Display,
    {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::dimmed(self))
        } else {
            self.to_string()
        }
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for u32 {}
impl Themed for u64 {}
impl Themed for usize {}
