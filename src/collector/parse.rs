//! Compile-time extraction from cell output.
//!
//! Graph compilation progress shows up in cell output as a progress bar
//! along the lines of:
//!
//! ```text
//! Graph compilation: 100%|##########| 100/100 [00:34<00:00]
//! ```
//!
//! The elapsed time is the `MM:SS` slice sitting just before the `00:00]`
//! remaining-time tail. This is a best-effort string scan of free-form
//! output, not a structured parse: any deviation from the expected shape
//! yields 0, never an error.

/// Progress marker emitted when graph compilation finishes.
const COMPLETION_MARKER: &str = "Graph compilation: 100%";

/// Remaining-time tail of a finished progress bar.
const END_MARKER: &str = "00:00]";

/// Extracts the graph compilation time, in seconds, from a cell's output
/// text. Returns 0 when no finished compilation bar is present or the
/// elapsed slice is malformed.
///
/// # Examples
///
/// ```
/// use cellwatch::collector::compile_time_seconds;
///
/// let output = "Graph compilation: 100%|##########| 100/100 [00:34<00:00]";
/// assert_eq!(compile_time_seconds(output), 34);
/// assert_eq!(compile_time_seconds("1\n"), 0);
/// ```
pub fn compile_time_seconds(output: &str) -> i64 {
    let Some(start) = output.find(COMPLETION_MARKER) else {
        return 0;
    };
    let Some(end) = output[start..].find(END_MARKER).map(|i| start + i) else {
        return 0;
    };

    // The elapsed time is the last six characters of the window, minus the
    // separator that precedes the end marker: "... [MM:SS<" -> "MM:SS".
    let window: Vec<char> = output[start..end].chars().collect();
    if window.len() < 6 {
        return 0;
    }
    let elapsed: String = window[window.len() - 6..window.len() - 1].iter().collect();
    mm_ss_seconds(&elapsed).unwrap_or(0)
}

/// Parses a strict `MM:SS` string into total seconds.
fn mm_ss_seconds(raw: &str) -> Option<i64> {
    let (minutes, seconds) = raw.split_once(':')?;
    if minutes.len() != 2 || seconds.len() != 2 {
        return None;
    }
    let minutes: i64 = minutes.parse().ok()?;
    let seconds: i64 = seconds.parse().ok()?;
    Some(minutes * 60 + seconds)
}
