use axum::{extract::State, response::Response, Json};
use serde::Deserialize;
use tracing::info;

use crate::{
  app::AppState,
  extractor::{Extractor, PageScrape},
  util::validate_url,
  Result,
};

#[derive(Deserialize)]
pub struct VideoRequest {
  url: Option<String>,
}

// find the video embedded in a web page and relay it to the client.
pub async fn download_direct(
  State(state): State<AppState>,
  Json(req): Json<VideoRequest>,
) -> Result<Response> {
  let url = validate_url(req.url.as_deref())?;
  info!(%url, "scraping page for video");

  let extraction = PageScrape::new(state.http.clone())
    .extract(url.as_str())
    .await?;
  extraction.respond(&state.http, "video.mp4").await
}
