use std::{
  pin::Pin,
  task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::Result;

/// Body stream tied to a cancellation token. Dropping the stream before it
/// reaches the end (the client went away) cancels the token; a stream that
/// ran to completion leaves the token alone.
pub struct GuardedStream<T> {
  stream: T,
  guard: Option<DropGuard>,
}

impl<T> GuardedStream<T> {
  pub fn new(stream: T, token: CancellationToken) -> Self {
    GuardedStream {
      stream,
      guard: Some(token.drop_guard()),
    }
  }
}

impl<T> Stream for GuardedStream<T>
where
  T: Stream<Item = Result<Bytes>> + Unpin,
{
  type Item = Result<Bytes>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    let this = &mut *self;
    let poll = Pin::new(&mut this.stream).poll_next(cx);
    if let Poll::Ready(None) = poll {
      if let Some(guard) = this.guard.take() {
        let _token = guard.disarm();
      }
    }
    poll
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use futures::{executor::block_on_stream, StreamExt};

  fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes>> {
    futures::stream::iter(
      parts
        .iter()
        .map(|bytes| Ok(Bytes::from_static(bytes)))
        .collect::<Vec<_>>(),
    )
  }

  #[test]
  fn test_exhausted_stream_keeps_token() {
    let token = CancellationToken::new();
    let stream = GuardedStream::new(chunks(&[b"hello", b"world"]), token.clone());

    let bytes = block_on_stream(stream)
      .map(Result::unwrap)
      .collect::<Vec<_>>();

    assert_eq!(bytes, vec![Bytes::from("hello"), Bytes::from("world")]);
    assert!(!token.is_cancelled());
  }

  #[test]
  fn test_dropped_stream_cancels_token() {
    let token = CancellationToken::new();
    let mut stream =
      GuardedStream::new(chunks(&[b"hello", b"world"]), token.clone());

    let first = futures::executor::block_on(stream.next());
    assert_eq!(first.unwrap().unwrap(), Bytes::from("hello"));
    assert!(!token.is_cancelled());

    drop(stream);
    assert!(token.is_cancelled());
  }
}
