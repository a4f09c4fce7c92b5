//! Encoder timemarks (`HH:MM:SS(.ms)`).

/// Parse a timemark into seconds.
///
/// Components are read right to left as seconds, minutes and hours.
/// Fragments that do not parse count as zero, and negative results (ffmpeg
/// prints a negative `out_time` before the first frame) clamp to zero.
pub fn parse_timemark(timemark: &str) -> f64 {
    let secs = timemark
        .trim()
        .split(':')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .unwrap_or(0.0)
        })
        .fold(0.0, |acc, part| acc * 60.0 + part);

    if secs.is_finite() {
        secs.max(0.0)
    } else {
        0.0
    }
}

/// Render seconds as `HH:MM:SS.mmm`.
pub fn format_timemark(secs: f64) -> String {
    let secs = if secs.is_finite() { secs.max(0.0) } else { 0.0 };
    let total_ms = (secs * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}
