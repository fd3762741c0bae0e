use owo_colors::OwoColorize;

/// Status output for the CLI.
///
/// Everything goes to stderr so an exported snapshot can be piped from stdout.
pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    /// Print a system/status message (indented)
    pub fn status(&self, message: &str) {
        eprintln!("  {}", message.dimmed());
    }

    /// Print an info message (indented)
    pub fn info(&self, label: &str, value: &str) {
        eprintln!("  {} {}", label.bright_blue(), value);
    }

    /// Print a success message (indented)
    pub fn success(&self, message: &str) {
        eprintln!("  {} {}", "✓".bright_green(), message);
    }

    /// Print a warning message (indented)
    pub fn warning(&self, message: &str) {
        eprintln!("  {} {}", "⚠".yellow(), message);
    }

    /// Print a key-value pair (indented)
    pub fn kv(&self, key: &str, value: &str) {
        eprintln!("  {} {}", format!("{}:", key).dimmed(), value);
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
