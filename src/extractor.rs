mod page_scrape;
mod ytdlp_stream;

use async_trait::async_trait;
use axum::{
  body::{boxed, Bytes, StreamBody},
  http::{header, Response, StatusCode},
  response,
};
use futures::{stream::BoxStream, StreamExt};

use crate::{util::content_disposition, Error, Result};

pub use page_scrape::PageScrape;
pub use ytdlp_stream::{Tracker, YtdlpStream};

pub enum Extraction {
  Proxy {
    url: String,
    headers: Vec<(String, String)>,
  },
  Stream {
    stream: BoxStream<'static, Result<Bytes>>,
    mime_type: String,
  },
}

#[async_trait]
pub trait Extractor {
  async fn extract(&self, url: &str) -> Result<Extraction>;
}

impl Extraction {
  /// Turns the extraction into a download response, relaying the remote
  /// media through `client` for `Proxy`.
  pub async fn respond(
    self,
    client: &reqwest::Client,
    filename: &str,
  ) -> Result<response::Response> {
    let builder = Response::builder()
      .status(StatusCode::OK)
      .header(header::CONTENT_DISPOSITION, content_disposition(filename));

    match self {
      Extraction::Stream { stream, mime_type } => {
        let resp = builder
          .header(header::CONTENT_TYPE, mime_type)
          .body(boxed(StreamBody::new(stream)))?;
        Ok(resp)
      }
      Extraction::Proxy { url, headers } => {
        let mut req = client.get(&url);
        for (k, v) in headers {
          req = req.header(k, v);
        }

        let upstream = req.send().await?;
        if !upstream.status().is_success() {
          return Err(Error::Upstream(upstream.status()));
        }

        let mut builder = builder
          .header(header::CONTENT_TYPE, "video/mp4")
          .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
        if let Some(len) = upstream.content_length() {
          builder = builder.header(header::CONTENT_LENGTH, len);
        }

        let stream = upstream.bytes_stream().map(|r| r.map_err(Error::from));
        Ok(builder.body(boxed(StreamBody::new(stream)))?)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use axum::body::HttpBody;

  use super::*;

  #[tokio::test]
  async fn test_stream_response_headers() {
    let stream = futures::stream::iter(vec![Ok(Bytes::from("abc"))]).boxed();
    let extraction = Extraction::Stream {
      stream,
      mime_type: "video/mp4".to_string(),
    };

    let mut resp = extraction
      .respond(&reqwest::Client::new(), "clip.mp4")
      .await
      .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
      resp.headers()[header::CONTENT_DISPOSITION],
      "attachment; filename=\"clip.mp4\""
    );
    let body = resp.body_mut().data().await.unwrap().unwrap();
    assert_eq!(body, Bytes::from("abc"));
  }
}
