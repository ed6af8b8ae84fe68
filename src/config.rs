use std::{net::SocketAddr, path::PathBuf, time::Duration};

use tracing::warn;

pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";

const DEFAULT_RETENTION_SECS: u64 = 60;
const DEFAULT_STALE_SECS: u64 = 5 * 60;
const DEFAULT_SWEEP_SECS: u64 = 30;
const DEFAULT_INFO_CACHE_SECS: u64 = 10 * 60;

#[derive(Debug, Clone)]
pub struct Config {
  pub listen_addr: SocketAddr,
  pub ytdlp_path: PathBuf,
  pub ytdlp_proxy: Option<String>,
  // how long finished downloads stay visible to pollers
  pub retention: Duration,
  // unfinished downloads idle this long are considered abandoned
  pub stale_after: Duration,
  pub sweep_interval: Duration,
  pub info_cache_ttl: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self::from_lookup(|_| None)
  }
}

impl Config {
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let get = |key: &str| {
      lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    };

    let listen_addr = get("LISTEN_ADDR")
      .and_then(|value| parse_or_warn("LISTEN_ADDR", &value))
      .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

    let ytdlp_path = match get("YTDLP_PATH") {
      Some(path) => PathBuf::from(path),
      None => {
        warn!("YTDLP_PATH is not set, looking up yt-dlp in PATH");
        PathBuf::from(DEFAULT_YTDLP_PATH)
      }
    };

    let secs = |key: &str, default: u64| {
      let secs = get(key)
        .and_then(|value| parse_or_warn::<u64>(key, &value))
        .unwrap_or(default);
      Duration::from_secs(secs)
    };

    Self {
      listen_addr,
      ytdlp_path,
      ytdlp_proxy: get("YTDLP_PROXY"),
      retention: secs("DOWNLOAD_RETENTION_SECS", DEFAULT_RETENTION_SECS),
      stale_after: secs("DOWNLOAD_STALE_SECS", DEFAULT_STALE_SECS),
      sweep_interval: secs("DOWNLOAD_SWEEP_SECS", DEFAULT_SWEEP_SECS)
        .max(Duration::from_secs(1)),
      info_cache_ttl: secs("INFO_CACHE_SECS", DEFAULT_INFO_CACHE_SECS),
    }
  }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
  let parsed = value.parse::<T>().ok();
  if parsed.is_none() {
    warn!(key, value, "ignoring unparsable setting");
  }
  parsed
}
