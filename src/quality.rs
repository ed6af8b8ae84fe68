use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

// every chain prefers mp4 video + m4a audio and bottoms out at plain mp4,
// so whatever yt-dlp picks can be served as video/mp4.
const LOW: &str =
  "bestvideo[height<=360][ext=mp4]+bestaudio[ext=m4a]/best[height<=360][ext=mp4]/mp4";
const MEDIUM: &str = "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720][ext=mp4]/bestvideo[height<=480][ext=mp4]+bestaudio[ext=m4a]/best[height<=480][ext=mp4]/mp4";
const HIGH: &str = "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]/bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720][ext=mp4]/mp4";
const ULTRA: &str = "bestvideo[height<=2160][ext=mp4]+bestaudio[ext=m4a]/best[height<=2160][ext=mp4]/bestvideo[height<=1440][ext=mp4]+bestaudio[ext=m4a]/best[height<=1440][ext=mp4]/bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]/mp4";

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
  Low,
  #[default]
  Medium,
  High,
  Ultra,
}

impl Quality {
  pub const ALL: [Quality; 4] =
    [Quality::Low, Quality::Medium, Quality::High, Quality::Ultra];

  pub fn as_str(self) -> &'static str {
    match self {
      Quality::Low => "low",
      Quality::Medium => "medium",
      Quality::High => "high",
      Quality::Ultra => "ultra",
    }
  }

  pub fn format_selector(self) -> &'static str {
    match self {
      Quality::Low => LOW,
      Quality::Medium => MEDIUM,
      Quality::High => HIGH,
      Quality::Ultra => ULTRA,
    }
  }

  pub fn format_args(self) -> [&'static str; 2] {
    ["-f", self.format_selector()]
  }

  pub fn parse(label: &str) -> Option<Self> {
    let label = label.trim();
    Self::ALL
      .into_iter()
      .find(|q| q.as_str().eq_ignore_ascii_case(label))
  }

  /// Resolves an optional query label. Unknown labels fall back to the
  /// default chain instead of failing the request.
  pub fn from_label(label: Option<&str>) -> Self {
    match label.filter(|l| !l.trim().is_empty()) {
      None => Quality::default(),
      Some(l) => Self::parse(l).unwrap_or_else(|| {
        warn!(quality = %l, "unknown quality label, using medium");
        Quality::default()
      }),
    }
  }
}

impl fmt::Display for Quality {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityOptions {
  pub low: &'static str,
  pub medium: &'static str,
  pub high: &'static str,
  pub ultra: &'static str,
}

impl QualityOptions {
  pub fn all() -> Self {
    Self {
      low: Quality::Low.format_selector(),
      medium: Quality::Medium.format_selector(),
      high: Quality::High.format_selector(),
      ultra: Quality::Ultra.format_selector(),
    }
  }
}
