//! In-memory bookkeeping for tracked downloads.
//!
//! A single actor owns the map from download id to state, so every status
//! transition is applied in message order. Terminal states (`complete`,
//! `error`, `cancelled`) are absorbing and are evicted after a retention
//! period; a periodic sweep forgets entries nobody has touched for a while
//! and that have no process attached.

use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use kameo::{actor::ActorRef, error::SendError, messages, Actor};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{progress::ProgressUpdate, quality::Quality, Error, Result};

const DEFAULT_SPEED: &str = "0 KiB/s";
const DEFAULT_DOWNLOADED: &str = "0 MiB";
const DEFAULT_TOTAL: &str = "Unknown";
const DEFAULT_ETA: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
  Starting,
  Downloading,
  Complete,
  Error,
  Cancelled,
}

impl DownloadStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      DownloadStatus::Complete
        | DownloadStatus::Error
        | DownloadStatus::Cancelled
    )
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Complete,
  Failed(String),
  Cancelled(String),
}

/// What pollers see for one download. Field names are snake_case on the
/// wire, which is what download clients read.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
  pub status: DownloadStatus,
  pub progress: f32,
  pub speed: String,
  pub downloaded_bytes: String,
  pub total_bytes: String,
  pub eta: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub quality: Option<Quality>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub filename: Option<String>,
  pub last_updated: i64,
}

impl Snapshot {
  fn not_found(id: &str) -> Self {
    Self {
      status: DownloadStatus::Error,
      progress: 0.0,
      speed: DEFAULT_SPEED.to_string(),
      downloaded_bytes: DEFAULT_DOWNLOADED.to_string(),
      total_bytes: DEFAULT_TOTAL.to_string(),
      eta: DEFAULT_ETA.to_string(),
      error: Some(Error::DownloadNotFound(id.to_string()).to_string()),
      url: None,
      quality: None,
      filename: None,
      last_updated: Utc::now().timestamp_millis(),
    }
  }
}

struct DownloadEntry {
  url: String,
  quality: Quality,
  filename: Option<String>,
  status: DownloadStatus,
  progress: f32,
  speed: Option<String>,
  downloaded: Option<String>,
  total: Option<String>,
  eta: Option<String>,
  error: Option<String>,
  last_updated: i64,
  touched: Instant,
  expires_at: Option<Instant>,
  cancel: Option<CancellationToken>,
}

impl DownloadEntry {
  fn new(url: String, quality: Quality, filename: Option<String>) -> Self {
    Self {
      url,
      quality,
      filename,
      status: DownloadStatus::Starting,
      progress: 0.0,
      speed: None,
      downloaded: None,
      total: None,
      eta: None,
      error: None,
      last_updated: Utc::now().timestamp_millis(),
      touched: Instant::now(),
      expires_at: None,
      cancel: None,
    }
  }

  fn touch(&mut self) {
    self.touched = Instant::now();
    self.last_updated = Utc::now().timestamp_millis();
  }

  fn terminate(&mut self, status: DownloadStatus, retention: Duration) {
    self.status = status;
    self.cancel = None;
    self.expires_at = Some(Instant::now() + retention);
    self.touch();
  }

  fn snapshot(&self) -> Snapshot {
    let text = |value: &Option<String>, default: &str| {
      value.clone().unwrap_or_else(|| default.to_string())
    };

    Snapshot {
      status: self.status,
      progress: self.progress,
      speed: text(&self.speed, DEFAULT_SPEED),
      downloaded_bytes: text(&self.downloaded, DEFAULT_DOWNLOADED),
      total_bytes: text(&self.total, DEFAULT_TOTAL),
      eta: text(&self.eta, DEFAULT_ETA),
      error: self.error.clone(),
      url: Some(self.url.clone()),
      quality: Some(self.quality),
      filename: self.filename.clone(),
      last_updated: self.last_updated,
    }
  }
}

#[derive(Actor)]
pub struct DownloadRegistry {
  downloads: HashMap<String, DownloadEntry>,
  retention: Duration,
  stale_after: Duration,
}

#[messages]
impl DownloadRegistry {
  #[message]
  async fn create(
    &mut self,
    url: String,
    quality: Quality,
    filename: Option<String>,
  ) -> Result<String> {
    let id = loop {
      let id = new_download_id();
      if !self.downloads.contains_key(&id) {
        break id;
      }
    };

    info!(%id, %url, %quality, "download registered");
    let entry = DownloadEntry::new(url, quality, filename);
    self.downloads.insert(id.clone(), entry);
    Ok(id)
  }

  #[message]
  async fn prepare(
    &mut self,
    id: String,
    url: String,
    quality: Quality,
    filename: Option<String>,
  ) -> Result<()> {
    match self.downloads.get_mut(&id) {
      None => {
        info!(%id, %url, %quality, "download registered on start");
        let entry = DownloadEntry::new(url, quality, filename);
        self.downloads.insert(id, entry);
        Ok(())
      }
      Some(entry) if entry.status.is_terminal() => {
        Err(Error::DownloadFinished(id))
      }
      Some(entry) if entry.status == DownloadStatus::Downloading => {
        Err(Error::DownloadRunning(id))
      }
      Some(entry) => {
        if filename.is_some() {
          entry.filename = filename;
        }
        entry.touch();
        Ok(())
      }
    }
  }

  #[message]
  async fn attach(&mut self, id: String, cancel: CancellationToken) -> Result<()> {
    let Some(entry) = self.downloads.get_mut(&id) else {
      cancel.cancel();
      return Err(Error::DownloadNotFound(id));
    };

    if entry.status.is_terminal() {
      // cancelled between prepare and spawn
      cancel.cancel();
      return Err(Error::DownloadFinished(id));
    }

    if entry.status == DownloadStatus::Downloading || entry.cancel.is_some() {
      // a second start for the same id; only the first process may run
      warn!(%id, "download already has a running process");
      cancel.cancel();
      return Err(Error::DownloadRunning(id));
    }

    entry.status = DownloadStatus::Downloading;
    entry.cancel = Some(cancel);
    entry.touch();
    debug!(%id, "download process attached");
    Ok(())
  }

  #[message]
  async fn update(&mut self, id: String, progress: ProgressUpdate) -> Result<()> {
    let Some(entry) = self.downloads.get_mut(&id) else {
      return Ok(());
    };
    if entry.status.is_terminal() {
      return Ok(());
    }

    entry.status = DownloadStatus::Downloading;
    entry.progress = progress.percent;
    if progress.speed.is_some() {
      entry.speed = progress.speed;
    }
    if progress.total.is_some() {
      entry.total = progress.total;
    }
    if progress.downloaded.is_some() {
      entry.downloaded = progress.downloaded;
    }
    if progress.eta.is_some() {
      entry.eta = progress.eta;
    }
    entry.touch();
    Ok(())
  }

  #[message]
  async fn finish(&mut self, id: String, outcome: Outcome) -> Result<bool> {
    let retention = self.retention;
    let Some(entry) = self.downloads.get_mut(&id) else {
      return Ok(false);
    };
    if entry.status.is_terminal() {
      return Ok(false);
    }

    match outcome {
      Outcome::Complete => {
        info!(%id, "download complete");
        entry.progress = 100.0;
        entry.eta = None;
        entry.terminate(DownloadStatus::Complete, retention);
      }
      Outcome::Failed(message) => {
        warn!(%id, %message, "download failed");
        entry.error = Some(message);
        entry.terminate(DownloadStatus::Error, retention);
      }
      Outcome::Cancelled(message) => {
        info!(%id, %message, "download cancelled");
        entry.error = Some(message);
        entry.terminate(DownloadStatus::Cancelled, retention);
      }
    }
    Ok(true)
  }

  #[message]
  async fn read_many(
    &mut self,
    ids: Vec<String>,
  ) -> Result<HashMap<String, Snapshot>> {
    let snapshots = ids
      .into_iter()
      .map(|id| {
        let snapshot = match self.downloads.get(&id) {
          Some(entry) => entry.snapshot(),
          None => Snapshot::not_found(&id),
        };
        (id, snapshot)
      })
      .collect();
    Ok(snapshots)
  }

  #[message]
  async fn cancel(&mut self, id: String) -> Result<bool> {
    let retention = self.retention;
    let Some(entry) = self.downloads.get_mut(&id) else {
      return Err(Error::DownloadNotFound(id));
    };

    match entry.status {
      DownloadStatus::Cancelled => Ok(false),
      DownloadStatus::Complete | DownloadStatus::Error => {
        Err(Error::DownloadFinished(id))
      }
      DownloadStatus::Starting | DownloadStatus::Downloading => {
        if let Some(token) = entry.cancel.take() {
          token.cancel();
        }
        entry.error = Some("Download cancelled by user.".to_string());
        entry.terminate(DownloadStatus::Cancelled, retention);
        info!(%id, "download cancelled by user");
        Ok(true)
      }
    }
  }

  #[message]
  async fn evict(&mut self, id: String, now: Instant) -> Result<bool> {
    let expired = self
      .downloads
      .get(&id)
      .and_then(|entry| entry.expires_at)
      .is_some_and(|at| at <= now);
    if expired {
      self.downloads.remove(&id);
      debug!(%id, "download evicted");
    }
    Ok(expired)
  }

  #[message]
  async fn sweep(&mut self, now: Instant) -> Result<usize> {
    let stale_after = self.stale_after;
    let before = self.downloads.len();

    self.downloads.retain(|id, entry| {
      let keep = match entry.expires_at {
        Some(at) => at > now,
        // a running process reports its own end, however quiet it is
        None if entry.cancel.is_some() => true,
        None => now.saturating_duration_since(entry.touched) < stale_after,
      };
      if !keep {
        debug!(%id, status = ?entry.status, "download swept");
      }
      keep
    });

    Ok(before - self.downloads.len())
  }

  #[message]
  async fn cancel_all(&mut self, reason: String) -> Result<usize> {
    let retention = self.retention;
    let mut cancelled = 0;
    for entry in self.downloads.values_mut() {
      if entry.status.is_terminal() {
        continue;
      }
      if let Some(token) = entry.cancel.take() {
        token.cancel();
      }
      entry.error = Some(reason.clone());
      entry.terminate(DownloadStatus::Cancelled, retention);
      cancelled += 1;
    }
    Ok(cancelled)
  }
}

impl DownloadRegistry {
  pub fn new(retention: Duration, stale_after: Duration) -> Self {
    Self {
      downloads: HashMap::new(),
      retention,
      stale_after,
    }
  }

  pub fn spawn(self) -> RegistryRef {
    let retention = self.retention;
    RegistryRef {
      actor: kameo::spawn(self),
      retention,
    }
  }
}

#[derive(Clone)]
pub struct RegistryRef {
  actor: ActorRef<DownloadRegistry>,
  retention: Duration,
}

impl RegistryRef {
  pub async fn create(
    &self,
    url: String,
    quality: Quality,
    filename: Option<String>,
  ) -> Result<String> {
    let msg = Create {
      url,
      quality,
      filename,
    };
    reply(self.actor.ask(msg).send().await)
  }

  pub async fn prepare(
    &self,
    id: String,
    url: String,
    quality: Quality,
    filename: Option<String>,
  ) -> Result<()> {
    let msg = Prepare {
      id,
      url,
      quality,
      filename,
    };
    reply(self.actor.ask(msg).send().await)
  }

  pub async fn attach(&self, id: String, cancel: CancellationToken) -> Result<()> {
    reply(self.actor.ask(Attach { id, cancel }).send().await)
  }

  pub async fn update(&self, id: String, progress: ProgressUpdate) -> Result<()> {
    reply(self.actor.ask(Update { id, progress }).send().await)
  }

  pub async fn finish(&self, id: String, outcome: Outcome) -> Result<()> {
    let msg = Finish {
      id: id.clone(),
      outcome,
    };
    if reply(self.actor.ask(msg).send().await)? {
      self.schedule_eviction(id);
    }
    Ok(())
  }

  pub async fn snapshot(
    &self,
    ids: Vec<String>,
  ) -> Result<HashMap<String, Snapshot>> {
    reply(self.actor.ask(ReadMany { ids }).send().await)
  }

  pub async fn cancel(&self, id: String) -> Result<()> {
    if reply(self.actor.ask(Cancel { id: id.clone() }).send().await)? {
      self.schedule_eviction(id);
    }
    Ok(())
  }

  pub async fn sweep(&self) -> Result<usize> {
    self.sweep_at(Instant::now()).await
  }

  pub async fn sweep_at(&self, now: Instant) -> Result<usize> {
    reply(self.actor.ask(Sweep { now }).send().await)
  }

  pub async fn cancel_all(&self, reason: &str) -> Result<usize> {
    let reason = reason.to_string();
    reply(self.actor.ask(CancelAll { reason }).send().await)
  }

  // finished entries stay readable for the retention period so the last
  // poll can still observe the terminal status.
  fn schedule_eviction(&self, id: String) {
    let registry = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(registry.retention).await;
      let msg = Evict {
        id: id.clone(),
        now: Instant::now(),
      };
      if let Err(e) = reply(registry.actor.ask(msg).send().await) {
        warn!(%id, "failed to evict download: {}", e);
      }
    });
  }
}

fn reply<T, M>(res: Result<T, SendError<M, Error>>) -> Result<T> {
  match res {
    Ok(value) => Ok(value),
    Err(SendError::HandlerError(e)) => Err(e),
    Err(_) => Err(Error::RegistryUnavailable),
  }
}

fn new_download_id() -> String {
  let millis = Utc::now().timestamp_millis();
  let salt: u32 = rand::thread_rng().gen();
  format!("{millis:x}-{salt:08x}")
}
