//! Status lines and spinners for the CLI.
//!
//! Everything except [`Output::value`] goes to stderr, so `cibox rootdir`
//! and the output of `cibox exec` stay clean on stdout.
//!
//! ```rust,ignore
//! use cibox::output::Output;
//!
//! let spinner = Output::spinner("Preparing ubuntu precise (x86_64)...");
//! spinner.set_message("ubuntu precise (x86_64): extracting...");
//! // Clear it before anything else writes to the terminal.
//! spinner.finish_clear();
//! Output::step("ubuntu precise (x86_64): installing-packages");
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::borrow::Cow;
use std::time::Duration;

pub struct Output;

impl Output {
    /// Example: `✓ Container ready`
    pub fn success(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✓".green().bold(), msg.as_ref());
    }

    /// Example: `✗ package installation failed`
    pub fn error(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), msg.as_ref().red());
    }

    /// Example: `⚠ unknown placeholder {mirror}`
    pub fn warning(msg: impl AsRef<str>) {
        eprintln!("{} {}", "⚠".yellow(), msg.as_ref());
    }

    /// Example: `→ Using cached container`
    pub fn info(msg: impl AsRef<str>) {
        eprintln!("{} {}", "→".cyan(), msg.as_ref().dimmed());
    }

    /// Example: `  • ubuntu precise (x86_64): installing-packages`
    pub fn step(msg: impl AsRef<str>) {
        eprintln!("  {} {}", "•".cyan(), msg.as_ref());
    }

    /// Aligned key/value pair, e.g. `  State:         ready`.
    pub fn kv(key: impl AsRef<str>, value: impl AsRef<str>) {
        eprintln!("  {:<14} {}", format!("{}:", key.as_ref()).cyan(), value.as_ref());
    }

    /// Example: `  → Run: cibox create /cache`
    pub fn hint(msg: impl AsRef<str>) {
        eprintln!("  {} {}", "→".cyan(), msg.as_ref());
    }

    /// A bare value for scripts, on stdout.
    pub fn value(msg: impl AsRef<str>) {
        println!("{}", msg.as_ref());
    }

    /// Animated until one of the `finish_*` methods is called.
    pub fn spinner(msg: impl Into<Cow<'static, str>>) -> Spinner {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(msg);
        pb.enable_steady_tick(Duration::from_millis(80));
        Spinner(pb)
    }
}

pub struct Spinner(ProgressBar);

impl Spinner {
    pub fn set_message(&self, msg: impl Into<Cow<'static, str>>) {
        self.0.set_message(msg);
    }

    pub fn finish_success(self, msg: impl AsRef<str>) {
        self.0
            .finish_with_message(format!("{} {}", "✓".green().bold(), msg.as_ref()));
    }

    pub fn finish_error(self, msg: impl AsRef<str>) {
        self.0
            .finish_with_message(format!("{} {}", "✗".red().bold(), msg.as_ref()));
    }

    /// Finish and clear the line.
    pub fn finish_clear(self) {
        self.0.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_methods_dont_panic() {
        Output::success("test");
        Output::error("test");
        Output::warning("test");
        Output::info("test");
        Output::step("test");
        Output::hint("test");
        Output::kv("key", "value");
        Output::value("value");
    }

    #[test]
    fn spinner_lifecycle() {
        let spinner = Output::spinner("Testing...");
        spinner.set_message("Still testing...");
        spinner.finish_success("Done");

        Output::spinner("Failing...").finish_error("Failed");
        Output::spinner("Quiet...").finish_clear();
    }
}
