//! Small helpers shared across modules.

use std::path::PathBuf;
use std::time::Duration;

/// Expand a leading `~` in a configured path to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/ca.pem"` → `"/home/user/ca.pem"`
/// - Anything else passes through unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if let Some(rest) = path.strip_prefix("~/") {
                expanded.push(rest);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Render a timeout for diagnostics: `"1 second"`, `"2.5 seconds"`.
pub fn describe_seconds(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    #[allow(clippy::float_cmp)]
    let suffix = if secs == 1.0 { "" } else { "s" };
    format!("{secs} second{suffix}")
}
