use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde_json::json;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("{0} is required")]
  MissingParam(&'static str),

  #[error("Unsupported URL {0}: {1}")]
  UnsupportedURL(String, &'static str),

  #[error("Download {0} not found")]
  DownloadNotFound(String),

  #[error("Download {0} has already finished")]
  DownloadFinished(String),

  #[error("Download {0} is already running")]
  DownloadRunning(String),

  #[error("Could not find video")]
  VideoNotFound,

  #[error("Upstream responded with status {0}")]
  Upstream(StatusCode),

  #[error("yt-dlp failed: {0}")]
  Ytdlp(String),

  #[error("Failed to parse video metadata")]
  Extraction,

  #[error("Failed to parse HTML: {0}")]
  InvalidHTML(String),

  #[error("Download registry is not available")]
  RegistryUnavailable,

  #[error("Server error: {0}")]
  Server(String),

  #[error("IO error: {0}")]
  IO(#[from] std::io::Error),

  #[error("Request error: {0}")]
  Reqwest(#[from] reqwest::Error),

  #[error("HTTP error: {0}")]
  Http(#[from] axum::http::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn status(&self) -> StatusCode {
    match self {
      Error::MissingParam(_) | Error::UnsupportedURL(..) => {
        StatusCode::BAD_REQUEST
      }
      Error::DownloadNotFound(_) | Error::VideoNotFound => {
        StatusCode::NOT_FOUND
      }
      Error::DownloadFinished(_) | Error::DownloadRunning(_) => {
        StatusCode::CONFLICT
      }
      Error::Upstream(status) => *status,
      Error::Ytdlp(_) | Error::Extraction | Error::Reqwest(_) => {
        StatusCode::BAD_GATEWAY
      }
      Error::InvalidHTML(_)
      | Error::RegistryUnavailable
      | Error::Server(_)
      | Error::IO(_)
      | Error::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      warn!(%status, "request failed: {}", self);
    }

    let message = match &self {
      Error::Upstream(_) => "Failed to download video".to_string(),
      other => other.to_string(),
    };

    (status, Json(json!({ "error": message }))).into_response()
  }
}
