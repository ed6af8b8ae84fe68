use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::{
  io::{AsyncBufReadExt, BufReader},
  process::{Child, ChildStderr},
  sync::oneshot,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{
  progress::{self, ProgressUpdate, StderrEvent},
  quality::Quality,
  registry::{DownloadStatus, Outcome, RegistryRef},
  util::GuardedStream,
  ytdlp::Ytdlp,
  Error, Result,
};

use super::{Extraction, Extractor};

const CONNECTION_CLOSED: &str = "Connection closed";

/// Reports the lifecycle of one download into the registry.
#[derive(Clone)]
pub struct Tracker {
  id: String,
  registry: RegistryRef,
}

impl Tracker {
  pub fn new(id: String, registry: RegistryRef) -> Self {
    Self { id, registry }
  }

  async fn report(&self, update: ProgressUpdate) {
    if let Err(e) = self.registry.update(self.id.clone(), update).await {
      debug!(id = %self.id, "dropping progress update: {e}");
    }
  }

  // the reason the registry recorded when it cancelled the download itself
  async fn cancel_reason(&self) -> Option<String> {
    let mut snapshots =
      self.registry.snapshot(vec![self.id.clone()]).await.ok()?;
    let snapshot = snapshots.remove(&self.id)?;
    if snapshot.status == DownloadStatus::Cancelled {
      snapshot.error
    } else {
      None
    }
  }

  async fn finish(&self, outcome: Outcome) {
    if let Err(e) = self.registry.finish(self.id.clone(), outcome).await {
      warn!(id = %self.id, "failed to record outcome: {e}");
    }
  }
}

// run yt-dlp command line and stream the merged video from its stdout.
pub struct YtdlpStream {
  ytdlp: Arc<Ytdlp>,
  quality: Quality,
  tracker: Option<Tracker>,
}

impl YtdlpStream {
  pub fn new(ytdlp: Arc<Ytdlp>, quality: Quality) -> Self {
    Self {
      ytdlp,
      quality,
      tracker: None,
    }
  }

  pub fn tracked(self, tracker: Tracker) -> Self {
    Self {
      tracker: Some(tracker),
      ..self
    }
  }
}

#[async_trait]
impl Extractor for YtdlpStream {
  async fn extract(&self, url: &str) -> Result<Extraction> {
    let mut child = match self.ytdlp.spawn_stream(url, self.quality) {
      Ok(child) => child,
      Err(e) => {
        if let Some(tracker) = &self.tracker {
          tracker.finish(Outcome::Failed(e.to_string())).await;
        }
        return Err(e);
      }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take())
    else {
      return Err(Error::Ytdlp("yt-dlp pipes were not opened".to_string()));
    };

    let token = CancellationToken::new();
    if let Some(tracker) = &self.tracker {
      // cancelled before the process started; the child is killed on drop
      tracker.registry.attach(tracker.id.clone(), token.clone()).await?;
    }

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(supervise(
      child,
      stderr,
      token.clone(),
      self.tracker.clone(),
      done_tx,
    ));

    // the body only ends cleanly when yt-dlp completed; a failure or a kill
    // after the first bytes surfaces as a body error
    let outcome = futures::stream::once(done_rx).filter_map(|outcome| {
      futures::future::ready(outcome_error(outcome).map(Err))
    });
    let stdout = ReaderStream::new(stdout)
      .map(|res| res.map_err(Error::from))
      .chain(outcome);
    let mut stream = GuardedStream::new(stdout, token);

    // hold the response until the first bytes arrive, so a failed
    // extraction becomes a proper error instead of an empty video
    match stream.next().await {
      Some(Ok(first)) => {
        let stream = futures::stream::once(async move { Ok(first) })
          .chain(stream)
          .boxed();
        let mime_type = String::from("video/mp4");
        Ok(Extraction::Stream { stream, mime_type })
      }
      Some(Err(e)) => Err(e),
      None => Err(Error::Ytdlp("yt-dlp produced no output".to_string())),
    }
  }
}

fn outcome_error(
  outcome: std::result::Result<Outcome, oneshot::error::RecvError>,
) -> Option<Error> {
  match outcome {
    Ok(Outcome::Complete) => None,
    Ok(Outcome::Failed(message)) | Ok(Outcome::Cancelled(message)) => {
      Some(Error::Ytdlp(message))
    }
    Err(_) => Some(Error::Ytdlp("yt-dlp supervisor went away".to_string())),
  }
}

async fn supervise(
  mut child: Child,
  stderr: ChildStderr,
  token: CancellationToken,
  tracker: Option<Tracker>,
  done: oneshot::Sender<Outcome>,
) {
  let reader = tokio::spawn(read_stderr(stderr, tracker.clone()));

  let outcome = tokio::select! {
    status = child.wait() => {
      let last_error = reader.await.ok().flatten();
      match status {
        Ok(status) if status.success() && last_error.is_none() => {
          Outcome::Complete
        }
        Ok(status) => Outcome::Failed(
          last_error.unwrap_or_else(|| format!("yt-dlp exited with {status}")),
        ),
        Err(e) => Outcome::Failed(format!("failed to wait for yt-dlp: {e}")),
      }
    }
    _ = token.cancelled() => {
      if let Err(e) = child.kill().await {
        warn!("failed to kill yt-dlp: {e}");
      }
      reader.abort();
      let reason = match &tracker {
        Some(tracker) => tracker.cancel_reason().await,
        None => None,
      };
      // nobody recorded a reason, so the response body was dropped
      let reason = reason.unwrap_or_else(|| CONNECTION_CLOSED.to_string());
      Outcome::Cancelled(reason)
    }
  };

  match &tracker {
    Some(tracker) => {
      info!(id = %tracker.id, ?outcome, "yt-dlp finished");
      tracker.finish(outcome.clone()).await;
    }
    None => debug!(?outcome, "yt-dlp finished"),
  }

  let _ = done.send(outcome);
}

// returns the last error line seen, if any
async fn read_stderr(
  stderr: ChildStderr,
  tracker: Option<Tracker>,
) -> Option<String> {
  let mut segments = BufReader::new(stderr).split(b'\n');
  let mut last_error = None;

  loop {
    let segment = match segments.next_segment().await {
      Ok(Some(segment)) => segment,
      Ok(None) => break,
      Err(e) => {
        debug!("stopped reading yt-dlp stderr: {e}");
        break;
      }
    };

    let text = String::from_utf8_lossy(&segment);
    for line in progress::split_lines(&text) {
      match progress::parse_line(line) {
        Some(StderrEvent::Progress(update)) => {
          if let Some(tracker) = &tracker {
            tracker.report(update).await;
          }
        }
        Some(StderrEvent::Error(message)) => {
          warn!("yt-dlp: {message}");
          if let Some(tracker) = &tracker {
            tracker.finish(Outcome::Failed(message.clone())).await;
          }
          last_error = Some(message);
        }
        None => debug!("yt-dlp: {line}"),
      }
    }
  }

  last_error
}

#[cfg(all(test, unix))]
mod tests {
  use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
  };

  use bytes::Bytes;
  use futures::stream::BoxStream;

  use super::*;
  use crate::registry::{DownloadRegistry, Snapshot};

  fn fake_ytdlp(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
      .unwrap();
    path
  }

  fn into_stream(
    extraction: Extraction,
  ) -> BoxStream<'static, Result<Bytes>> {
    let Extraction::Stream { stream, .. } = extraction else {
      panic!("expected a stream");
    };
    stream
  }

  async fn collect(extraction: Extraction) -> Vec<u8> {
    let mut stream = into_stream(extraction);
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
      out.extend_from_slice(&chunk.unwrap());
    }
    out
  }

  async fn wait_terminal(registry: &RegistryRef, id: &str) -> Snapshot {
    for _ in 0..50 {
      let snapshot = registry
        .snapshot(vec![id.to_string()])
        .await
        .unwrap()
        .remove(id)
        .unwrap();
      if snapshot.status.is_terminal() {
        return snapshot;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("download {id} never finished");
  }

  async fn start(
    registry: &RegistryRef,
    script: &Path,
    url: &str,
  ) -> (String, Result<Extraction>) {
    let id = registry
      .create(url.to_string(), Quality::Low, None)
      .await
      .unwrap();
    let ytdlp = Arc::new(Ytdlp::new(script, None));
    let extractor = YtdlpStream::new(ytdlp, Quality::Low)
      .tracked(Tracker::new(id.clone(), registry.clone()));
    let extraction = extractor.extract(url).await;
    (id, extraction)
  }

  // every scenario shares one test so no other test forks while a script
  // file is still open for writing
  #[tokio::test]
  async fn test_stream_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let ok = fake_ytdlp(
      &dir,
      "ok",
      concat!(
        "echo '[download]  50.0% of 10.00MiB at 1.00MiB/s ETA 00:05' >&2\n",
        "printf 'fake video bytes'\n",
        "echo '[download] 100% of 10.00MiB in 00:00:01 at 1.00MiB/s' >&2",
      ),
    );
    let broken = fake_ytdlp(
      &dir,
      "broken",
      "echo 'ERROR: [generic] Unsupported URL: x' >&2\nexit 1",
    );
    let truncated = fake_ytdlp(
      &dir,
      "truncated",
      concat!(
        "printf 'partial'\n",
        "sleep 0.2\n",
        "echo 'ERROR: network dropped' >&2\n",
        "exit 1",
      ),
    );
    let slow = fake_ytdlp(
      &dir,
      "slow",
      concat!(
        "i=0\n",
        "while [ $i -lt 50 ]; do printf 'xxxxx'; sleep 0.2; i=$((i+1)); done",
      ),
    );

    let registry =
      DownloadRegistry::new(Duration::from_secs(60), Duration::from_secs(300))
        .spawn();
    let url = "https://example.com/v";

    // clean run
    let (id, extraction) = start(&registry, &ok, url).await;
    let bytes = collect(extraction.unwrap()).await;
    assert_eq!(Bytes::from(bytes), Bytes::from("fake video bytes"));
    assert_eq!(
      wait_terminal(&registry, &id).await.status,
      DownloadStatus::Complete
    );

    // failure before any bytes: a plain error response
    let (id, extraction) = start(&registry, &broken, url).await;
    let err = extraction.err().unwrap();
    assert!(err.to_string().contains("Unsupported URL"));
    let snapshot = wait_terminal(&registry, &id).await;
    assert_eq!(snapshot.status, DownloadStatus::Error);

    // failure after bytes were sent: the body ends with an error
    let (id, extraction) = start(&registry, &truncated, url).await;
    let items: Vec<_> = into_stream(extraction.unwrap()).collect().await;
    assert!(items.first().unwrap().is_ok());
    let err = items.last().unwrap().as_ref().unwrap_err();
    assert!(err.to_string().contains("network dropped"));
    let snapshot = wait_terminal(&registry, &id).await;
    assert_eq!(snapshot.status, DownloadStatus::Error);

    // user cancel while streaming: the process dies, the body errors out
    let (id, extraction) = start(&registry, &slow, url).await;
    let mut stream = into_stream(extraction.unwrap());
    assert!(stream.next().await.unwrap().is_ok());
    registry.cancel(id.clone()).await.unwrap();
    let rest: Vec<_> = tokio::time::timeout(
      Duration::from_secs(5),
      stream.collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    let err = rest.last().unwrap().as_ref().unwrap_err();
    assert!(err.to_string().contains("cancelled by user"));
    let snapshot = wait_terminal(&registry, &id).await;
    assert_eq!(snapshot.status, DownloadStatus::Cancelled);

    // client went away midway: dropping the body kills the process
    let (id, extraction) = start(&registry, &slow, url).await;
    let mut stream = into_stream(extraction.unwrap());
    assert!(stream.next().await.unwrap().is_ok());
    drop(stream);
    let snapshot = wait_terminal(&registry, &id).await;
    assert_eq!(snapshot.status, DownloadStatus::Cancelled);
    assert_eq!(snapshot.error.as_deref(), Some(CONNECTION_CLOSED));
  }
}
