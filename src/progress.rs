//! Parsing of the human-readable status text yt-dlp writes to stderr.
//!
//! Typical input:
//!
//! ```text
//! [download]  45.3% of ~ 10.00MiB at  1.23MiB/s ETA 00:05 (frag 3/10)
//! [download] 100% of   10.00MiB in 00:00:08 at 1.20MiB/s
//! ERROR: [generic] Unable to download webpage: HTTP Error 404
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

static PROGRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
  Regex::new(concat!(
    r"\[download\]\s+(?P<percent>\d+(?:\.\d+)?)%",
    r"(?:\s+of\s+~?\s*(?P<total>\d+(?:\.\d+)?\s*[KMGTP]?i?B|Unknown total size))?",
    r"(?:\s+in\s+\S+)?",
    r"(?:\s+at\s+(?P<speed>\d+(?:\.\d+)?\s*[KMGTP]?i?B/s|Unknown B/s|Unknown speed))?",
    r"(?:\s+ETA\s+(?P<eta>\S+))?",
  ))
  .unwrap()
});

static SIZE_REGEX: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"^(?P<num>\d+(?:\.\d+)?)\s*(?P<unit>[KMGTP]?i?B)$").unwrap()
});

const ERROR_MARKER: &str = "ERROR:";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
  pub percent: f32,
  pub total: Option<String>,
  pub downloaded: Option<String>,
  pub speed: Option<String>,
  pub eta: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StderrEvent {
  Progress(ProgressUpdate),
  Error(String),
}

/// Splits a chunk of stderr text into logical lines. yt-dlp redraws its
/// progress line with `\r` unless `--newline` is honoured.
pub fn split_lines(text: &str) -> impl Iterator<Item = &str> {
  text
    .split(|c| c == '\n' || c == '\r')
    .map(str::trim)
    .filter(|line| !line.is_empty())
}

pub fn parse_line(line: &str) -> Option<StderrEvent> {
  if let Some(idx) = line.find(ERROR_MARKER) {
    let message = line[idx + ERROR_MARKER.len()..].trim();
    return Some(StderrEvent::Error(message.to_string()));
  }

  let caps = PROGRESS_REGEX.captures(line)?;
  let percent = caps
    .name("percent")?
    .as_str()
    .parse::<f32>()
    .ok()?
    .clamp(0.0, 100.0);

  let total = caps
    .name("total")
    .map(|m| m.as_str())
    .filter(|s| !s.starts_with("Unknown"))
    .map(|s| s.replace(' ', ""));
  let speed = caps
    .name("speed")
    .map(|m| m.as_str())
    .filter(|s| !s.starts_with("Unknown"))
    .map(|s| s.replace(' ', ""));
  let eta = caps
    .name("eta")
    .map(|m| m.as_str())
    .filter(|s| !s.eq_ignore_ascii_case("unknown"))
    .map(str::to_string);
  let downloaded = total
    .as_deref()
    .and_then(|total| downloaded_of(total, percent));

  Some(StderrEvent::Progress(ProgressUpdate {
    percent,
    total,
    downloaded,
    speed,
    eta,
  }))
}

/// Parses sizes like `10.00MiB` or `512KB` into bytes.
pub fn parse_size(s: &str) -> Option<f64> {
  let caps = SIZE_REGEX.captures(s.trim())?;
  let num = caps.name("num")?.as_str().parse::<f64>().ok()?;
  let multiplier = unit_multiplier(caps.name("unit")?.as_str())?;
  Some(num * multiplier)
}

pub fn format_size(bytes: f64, unit: &str) -> Option<String> {
  let multiplier = unit_multiplier(unit)?;
  Some(format!("{:.2}{}", bytes / multiplier, unit))
}

fn downloaded_of(total: &str, percent: f32) -> Option<String> {
  let caps = SIZE_REGEX.captures(total)?;
  let unit = caps.name("unit")?.as_str();
  let bytes = parse_size(total)? * f64::from(percent) / 100.0;
  format_size(bytes, unit)
}

fn unit_multiplier(unit: &str) -> Option<f64> {
  let m = match unit {
    "B" => 1.0,
    "KiB" => 1024.0,
    "MiB" => 1024.0_f64.powi(2),
    "GiB" => 1024.0_f64.powi(3),
    "TiB" => 1024.0_f64.powi(4),
    "PiB" => 1024.0_f64.powi(5),
    "KB" => 1e3,
    "MB" => 1e6,
    "GB" => 1e9,
    "TB" => 1e12,
    "PB" => 1e15,
    _ => return None,
  };
  Some(m)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn progress(line: &str) -> ProgressUpdate {
    match parse_line(line) {
      Some(StderrEvent::Progress(p)) => p,
      other => panic!("expected progress for {line:?}, got {other:?}"),
    }
  }

  #[test]
  fn test_parse_running_line() {
    let p = progress(
      "[download]  45.3% of ~ 10.00MiB at  1.23MiB/s ETA 00:05 (frag 3/10)",
    );
    assert_eq!(p.percent, 45.3);
    assert_eq!(p.total.as_deref(), Some("10.00MiB"));
    assert_eq!(p.speed.as_deref(), Some("1.23MiB/s"));
    assert_eq!(p.eta.as_deref(), Some("00:05"));
    assert_eq!(p.downloaded.as_deref(), Some("4.53MiB"));
  }

  #[test]
  fn test_parse_finished_line() {
    let p = progress("[download] 100% of   10.00MiB in 00:00:08 at 1.20MiB/s");
    assert_eq!(p.percent, 100.0);
    assert_eq!(p.downloaded.as_deref(), Some("10.00MiB"));
    assert_eq!(p.speed.as_deref(), Some("1.20MiB/s"));
    assert_eq!(p.eta, None);
  }

  #[test]
  fn test_parse_unknown_fields() {
    let p = progress(
      "[download]   0.0% of Unknown total size at Unknown B/s ETA Unknown",
    );
    assert_eq!(p.percent, 0.0);
    assert_eq!(p.total, None);
    assert_eq!(p.downloaded, None);
    assert_eq!(p.speed, None);
    assert_eq!(p.eta, None);
  }

  #[test]
  fn test_parse_error_line() {
    assert_eq!(
      parse_line("ERROR: [generic] Unable to download webpage: HTTP 404"),
      Some(StderrEvent::Error(
        "[generic] Unable to download webpage: HTTP 404".to_string()
      ))
    );
  }

  #[test]
  fn test_other_lines_are_ignored() {
    assert_eq!(parse_line("[download] Destination: -"), None);
    assert_eq!(parse_line("WARNING: falling back to generic"), None);
    assert_eq!(parse_line("[youtube] abc: Downloading webpage"), None);
  }

  #[test]
  fn test_split_lines_handles_carriage_returns() {
    let text = "[download]   1.0% of 2.00MiB\r[download]   2.0% of 2.00MiB\n\n";
    let lines: Vec<_> = split_lines(text).collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].contains("2.0%"));
  }

  #[test]
  fn test_sizes() {
    assert_eq!(parse_size("1.00KiB"), Some(1024.0));
    assert_eq!(parse_size("2MB"), Some(2e6));
    assert_eq!(parse_size("lots"), None);
    assert_eq!(format_size(1536.0, "KiB").as_deref(), Some("1.50KiB"));
  }
}
