//! Terminal logging with coloured module prefixes.
//!
//! ```ignore
//! log!("build"; "rendered {} pages", count);
//! ```

use colored::{ColoredString, Colorize};
use std::io::{Write, stdout};

/// Log a message with a coloured module prefix.
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

pub fn log(module: &str, message: &str) {
    let prefix = colorize_prefix(module);
    let mut stdout = stdout().lock();
    writeln!(stdout, "{prefix} {message}").ok();
    stdout.flush().ok();
}

fn colorize_prefix(module: &str) -> ColoredString {
    let prefix = format!("[{module}]");
    match module {
        "serve" => prefix.bright_blue().bold(),
        "watch" => prefix.bright_green().bold(),
        "error" => prefix.bright_red().bold(),
        _ => prefix.bright_yellow().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_carries_module_name() {
        let p = colorize_prefix("build");
        assert!(p.to_string().contains("[build]"));
    }

    #[test]
    fn test_prefix_module_colours_differ() {
        // serve and error use distinct colour codes so the eye can
        // separate server traffic from failures
        colored::control::set_override(true);
        let serve = colorize_prefix("serve").to_string();
        let error = colorize_prefix("error").to_string();
        colored::control::unset_override();
        assert_ne!(serve, error);
    }
}
