use std::{
  path::PathBuf,
  process::{Output, Stdio},
};

use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{
  config::Config,
  progress::{self, StderrEvent},
  quality::Quality,
  util::{redact_proxy, YTDLP_LIMIT},
  Error, Result,
};

// sent with every request so yt-dlp looks like a mobile browser
const ADD_HEADERS: [&str; 5] = [
  "referer:youtube.com",
  "user-agent:Mozilla/5.0 (Linux; Android 12; SM-S906N Build/QP1A.190711.020) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.6167.101 Mobile Safari/537.36",
  "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
  "Accept-Language: en-US,en;q=0.5",
  "DNT: 1",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
  pub title: String,
  pub ext: String,
}

/// Launcher for the yt-dlp executable.
#[derive(Debug, Clone)]
pub struct Ytdlp {
  binary: PathBuf,
  proxy: Option<String>,
}

impl Ytdlp {
  pub fn new(binary: impl Into<PathBuf>, proxy: Option<String>) -> Self {
    Self {
      binary: binary.into(),
      proxy,
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(config.ytdlp_path.clone(), config.ytdlp_proxy.clone())
  }

  fn command(&self) -> Command {
    let mut cmd = Command::new(&self.binary);
    cmd
      .arg("--no-playlist")
      .arg("--no-check-certificates")
      .arg("--no-warnings")
      .arg("--prefer-free-formats")
      .arg("--extractor-args")
      .arg("generic:impersonate");

    for header in ADD_HEADERS {
      cmd.arg("--add-header").arg(header);
    }

    if let Some(proxy) = &self.proxy {
      debug!(proxy = %redact_proxy(proxy), "running yt-dlp through proxy");
      cmd.arg("--proxy").arg(proxy);
    }

    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd
  }

  fn stream_command(&self, url: &str, quality: Quality) -> Command {
    let mut cmd = self.command();
    cmd
      .args(quality.format_args())
      .arg("--newline")
      .arg("-o")
      .arg("-")
      .arg("--")
      .arg(url)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    cmd
  }

  pub async fn metadata(&self, url: &str) -> Result<VideoMetadata> {
    #[derive(Deserialize)]
    struct YtdlpOutput {
      title: Option<String>,
      ext: Option<String>,
    }

    let mut cmd = self.command();
    cmd.arg("--dump-single-json").arg("--").arg(url);
    let output = run_limited(cmd).await?;

    let output: YtdlpOutput =
      serde_json::from_slice(&output.stdout).map_err(|e| {
        warn!(%url, "unexpected yt-dlp metadata: {e}");
        Error::Extraction
      })?;

    Ok(VideoMetadata {
      title: output.title.unwrap_or_else(|| "video".to_string()),
      ext: output.ext.unwrap_or_else(|| "mp4".to_string()),
    })
  }

  pub async fn list_formats(&self, url: &str) -> Result<String> {
    let mut cmd = self.command();
    cmd.arg("--list-formats").arg("--").arg(url);
    let output = run_limited(cmd).await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
  }

  /// Starts a download writing the media to stdout and progress to stderr.
  pub fn spawn_stream(&self, url: &str, quality: Quality) -> Result<Child> {
    debug!(%url, %quality, "spawning yt-dlp");
    Ok(self.stream_command(url, quality).spawn()?)
  }
}

async fn run_limited(mut cmd: Command) -> Result<Output> {
  let guard = YTDLP_LIMIT.acquire().await;
  let output = cmd.output().await?;
  drop(guard);

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = last_error(&stderr)
      .unwrap_or_else(|| format!("yt-dlp exited with {}", output.status));
    return Err(Error::Ytdlp(message));
  }

  Ok(output)
}

fn last_error(stderr: &str) -> Option<String> {
  progress::split_lines(stderr)
    .filter_map(|line| match progress::parse_line(line) {
      Some(StderrEvent::Error(message)) => Some(message),
      _ => None,
    })
    .last()
}

#[cfg(test)]
mod tests {
  use std::ffi::OsStr;

  use super::*;

  fn args(cmd: &Command) -> Vec<String> {
    cmd
      .as_std()
      .get_args()
      .map(OsStr::to_string_lossy)
      .map(|s| s.into_owned())
      .collect()
  }

  #[test]
  fn test_stream_command_args() {
    let ytdlp = Ytdlp::new("yt-dlp", None);
    let url = "https://example.com/watch?v=-abc";
    let args = args(&ytdlp.stream_command(url, Quality::High));

    assert!(args.contains(&"--no-playlist".to_string()));
    assert!(args.contains(&"generic:impersonate".to_string()));
    assert!(!args.contains(&"--proxy".to_string()));

    let f = args.iter().position(|a| a == "-f").unwrap();
    assert_eq!(args[f + 1], Quality::High.format_selector());

    let tail = &args[args.len() - 5..];
    assert_eq!(tail, ["--newline", "-o", "-", "--", url]);
  }

  #[test]
  fn test_proxy_is_passed() {
    let ytdlp = Ytdlp::new("yt-dlp", Some("socks5://127.0.0.1:1080".into()));
    let args = args(&ytdlp.command());
    let idx = args.iter().position(|a| a == "--proxy").unwrap();
    assert_eq!(args[idx + 1], "socks5://127.0.0.1:1080");
  }

  #[test]
  fn test_add_headers() {
    let args = args(&Ytdlp::new("yt-dlp", None).command());
    let headers = args
      .iter()
      .zip(args.iter().skip(1))
      .filter(|(flag, _)| *flag == "--add-header")
      .count();
    assert_eq!(headers, ADD_HEADERS.len());
  }

  #[test]
  fn test_last_error() {
    let stderr = "WARNING: slow\nERROR: first\r\nERROR: second\n";
    assert_eq!(last_error(stderr).as_deref(), Some("second"));
    assert_eq!(last_error("[info] nothing wrong"), None);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_metadata_nonzero_exit() {
    let ytdlp = Ytdlp::new("/bin/false", None);
    let err = ytdlp.metadata("https://example.com").await.unwrap_err();
    assert!(matches!(err, Error::Ytdlp(_)));
  }
}
