//! Transports for pulling objects from the messaging platform.
//!
//! There are two of them:
//!
//! - [`bot_api::BotApiClient`]: the plain HTTP bot API. It is cheap to use but refuses to serve
//!   objects above a size ceiling, which it signals with a "file is too big" error.
//! - [`runtime::SessionRuntime`]: a persistent [`session::ObjectSession`] living on a dedicated
//!   single-threaded event loop. Work is handed to it through the bounded [`queue::WorkQueue`] and
//!   results flow back through a per-job channel.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};

pub use crate::caching::FetchError;

pub mod bot_api;
pub mod queue;
pub mod runtime;
pub mod session;

/// The size of the chunks yielded by every byte stream.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// A stream of object bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Re-slices `inner` into chunks of exactly `chunk_size` bytes, except for the last one.
///
/// The first error is passed through and ends the stream.
pub fn rechunk<S>(inner: S, chunk_size: usize) -> impl Stream<Item = Result<Bytes, FetchError>>
where
    S: Stream<Item = Result<Bytes, FetchError>> + Unpin,
{
    let state = (inner, BytesMut::new(), false);
    stream::unfold(state, move |(mut inner, mut buf, mut done)| async move {
        loop {
            if buf.len() >= chunk_size {
                let chunk = buf.split_to(chunk_size).freeze();
                return Some((Ok(chunk), (inner, buf, done)));
            }
            if done {
                if buf.is_empty() {
                    return None;
                }
                let chunk = buf.split().freeze();
                return Some((Ok(chunk), (inner, buf, done)));
            }
            match inner.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    buf.clear();
                    return Some((Err(err), (inner, buf, true)));
                }
                None => done = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn source(parts: &[&[u8]]) -> impl Stream<Item = Result<Bytes, FetchError>> + Unpin {
        let parts: Vec<_> = parts.iter().map(|p| Ok(Bytes::copy_from_slice(p))).collect();
        stream::iter(parts)
    }

    #[tokio::test]
    async fn test_rechunk_sizes() {
        let parts: &[&[u8]] = &[b"ab", b"cdefg", b"", b"hij", b"k"];
        let chunks: Vec<_> = rechunk(source(parts), 4).try_collect().await.unwrap();

        assert_eq!(chunks, [&b"abcd"[..], b"efgh", b"ijk"]);
    }

    #[tokio::test]
    async fn test_rechunk_exact_multiple() {
        let chunks: Vec<_> = rechunk(source(&[b"abcdef"]), 3).try_collect().await.unwrap();
        assert_eq!(chunks, [&b"abc"[..], b"def"]);
    }

    #[tokio::test]
    async fn test_rechunk_empty() {
        let chunks: Vec<Bytes> = rechunk(source(&[]), 3).try_collect().await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_rechunk_error_ends_stream() {
        let inner = stream::iter(vec![
            Ok(Bytes::from_static(b"abcde")),
            Err(FetchError::NotFoundUpstream),
            Ok(Bytes::from_static(b"never")),
        ]);
        let items: Vec<_> = rechunk(inner, 4).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &b"abcd"[..]);
        assert!(matches!(items[1], Err(FetchError::NotFoundUpstream)));
    }
}
