//! User-facing console messages.
//!
//! Operational output (what the user asked for) goes through [`Console`]; diagnostics go
//! through `tracing`.
use std::fmt::Display;

pub const GREEN_BOLD: &str = "\x1b[1;32m";
pub const RED_BOLD: &str = "\x1b[1;31m";
pub const YELLOW_BOLD: &str = "\x1b[1;33m";
pub const CYAN_BOLD: &str = "\x1b[1;36m";
pub const DIM: &str = "\x1b[2m";
pub const RESET: &str = "\x1b[0m";

/// Verbosity-aware printer for status messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console {
    quiet: bool,
    verbose: bool,
}

impl Console {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self { quiet, verbose }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Section header.
    pub fn banner(&self, message: impl Display) {
        if !self.quiet {
            println!("\n{CYAN_BOLD}{message}{RESET}");
        }
    }

    /// Progress line, shown unless quiet.
    pub fn step(&self, message: impl Display) {
        if !self.quiet {
            println!("  {message}");
        }
    }

    /// Extra detail, shown only when verbose.
    pub fn detail(&self, message: impl Display) {
        if self.verbose && !self.quiet {
            println!("  {DIM}{message}{RESET}");
        }
    }

    pub fn ok(&self, message: impl Display) {
        if !self.quiet {
            println!("  {GREEN_BOLD}✓{RESET} {message}");
        }
    }

    pub fn warn(&self, message: impl Display) {
        if !self.quiet {
            println!("  {YELLOW_BOLD}!{RESET} {message}");
        }
    }

    /// Failures are always shown, on stderr.
    pub fn fail(&self, message: impl Display) {
        eprintln!("{RED_BOLD}✗{RESET} {message}");
    }

    /// Follow-up advice printed after a failure.
    pub fn hint(&self, message: impl Display) {
        eprintln!("  {DIM}→ {message}{RESET}");
    }

    /// Plain output that must reach the user even in quiet mode.
    pub fn print(&self, message: impl Display) {
        println!("{message}");
    }
}
