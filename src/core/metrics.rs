//! Live typing metrics
//!
//! Net WPM and accuracy as raced: WPM counts currently-correct characters
//! in standard five-character words over elapsed time; accuracy is the
//! share of currently-correct characters among those typed. Both follow
//! the verdict buffer, so a corrected mistake stops counting against you.

use std::time::Duration;

/// Net words-per-minute: `(typed - errors) / 5` words over the elapsed
/// minutes. Zero before any time has passed.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use keysprint_engine::core::metrics::net_wpm;
///
/// // 300 clean characters in one minute = 60 WPM
/// assert_eq!(net_wpm(300, 0, Duration::from_secs(60)), 60.0);
/// ```
pub fn net_wpm(chars_typed: u32, errors: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    let correct = chars_typed.saturating_sub(errors) as f64;
    (correct / 5.0) / (secs / 60.0)
}

/// Accuracy percentage, clamped to [0, 100]. An untouched buffer counts
/// as 100 so the display never opens on a scary zero.
pub fn accuracy(chars_typed: u32, errors: u32) -> f64 {
    if chars_typed == 0 {
        return 100.0;
    }
    let correct = chars_typed.saturating_sub(errors) as f64;
    (correct / chars_typed as f64 * 100.0).clamp(0.0, 100.0)
}

/// Format a finish gap as "+M:SS", or "+H:MM:SS" past an hour.
///
/// # Examples
///
/// ```
/// use keysprint_engine::core::metrics::format_gap;
///
/// assert_eq!(format_gap(83_000), "+1:23");
/// assert_eq!(format_gap(3_723_000), "+1:02:03");
/// ```
pub fn format_gap(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("+{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("+{}:{:02}", mins, secs)
    }
}
