//! Newline-delimited JSON encoding of delta streams.
//!
//! Each delta becomes one line. A stream error is written in-band as a
//! final `{"error": {...}}` line and ends the body, since the HTTP status
//! has already been sent by the time it happens.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use serde::Serialize;

use crate::delta::Delta;
use crate::error::{WatchError, WatchResult};

pub const CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Serialize)]
struct ErrorLine<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

/// Encode one value as a JSON line.
pub fn encode_line<T: Serialize>(value: &T) -> WatchResult<Bytes> {
    let mut buf = serde_json::to_vec(value).map_err(|e| WatchError::Encode(e.to_string()))?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

fn error_line(err: &WatchError) -> WatchResult<Bytes> {
    encode_line(&ErrorLine {
        error: ErrorBody {
            code: err.code(),
            message: err.to_string(),
        },
    })
}

/// Adapts a stream of deltas into a stream of JSON lines.
pub struct NdjsonStream<S> {
    inner: S,
    done: bool,
}

impl<S> NdjsonStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, done: false }
    }
}

impl<S, R> Stream for NdjsonStream<S>
where
    S: Stream<Item = WatchResult<Delta<R>>> + Unpin,
    R: Serialize,
{
    type Item = WatchResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(delta))) => Poll::Ready(Some(encode_line(&delta))),
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                Poll::Ready(Some(error_line(&err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use compute_state::{ResourceMetadata, VNet, VNetSpec};

    use super::*;
    use crate::snapshot::SnapshotStream;

    fn lines(bytes: &[Bytes]) -> Vec<serde_json::Value> {
        bytes
            .iter()
            .map(|b| {
                assert_eq!(b.last(), Some(&b'\n'));
                serde_json::from_slice(b).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn snapshot_encodes_one_line_per_delta() {
        let mut vnet = VNet {
            metadata: ResourceMetadata::new("123456789012", "net", "id-net"),
            spec: VNetSpec::default(),
        };
        vnet.metadata.resource_version = 3;
        let body: Vec<Bytes> = NdjsonStream::new(SnapshotStream::new(vec![vnet], 4))
            .map(Result::unwrap)
            .collect()
            .await;

        let json = lines(&body);
        assert_eq!(json.len(), 2);
        assert_eq!(json[0]["type"], "Updated");
        assert_eq!(json[0]["object"]["metadata"]["name"], "net");
        assert_eq!(json[1]["type"], "Bookmark");
        assert_eq!(json[1]["resource_version"], 4);
        assert!(json[1].get("object").is_none());
    }

    #[tokio::test]
    async fn error_is_written_in_band_and_ends_the_stream() {
        let deltas = futures_util::stream::iter(vec![
            Ok(Delta::<VNet>::bookmark(1)),
            Err(WatchError::TooOldResourceVersion { resource_version: 1 }),
            Ok(Delta::<VNet>::bookmark(2)),
        ]);
        let body: Vec<Bytes> = NdjsonStream::new(deltas).map(Result::unwrap).collect().await;

        let json = lines(&body);
        assert_eq!(json.len(), 2);
        assert_eq!(json[1]["error"]["code"], "TooOldResourceVersion");
    }
}
