//! Streaming body capture.
//!
//! Wraps a request or response body so the bytes keep flowing to their
//! destination while a copy of every chunk is collected on the side.

use axum::body::{Body, Bytes};
use bytes::BytesMut;
use futures::{Future, StreamExt};
use http_body_util::BodyExt;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::error;

/// Error produced when the underlying body stream fails mid-capture.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("body stream error: {0}")]
    Stream(String),
}

type CapturedBody = Pin<Box<dyn Future<Output = Result<Bytes, CaptureError>> + Send>>;

/// Split a body into a pass-through stream and a future resolving to the
/// complete captured bytes once the stream has been fully consumed.
///
/// The returned body behaves exactly like the original; the future completes
/// only after the last chunk has flowed through, so awaiting it never stalls
/// the transfer itself.
pub fn capture_body<B>(body: B) -> (Body, CapturedBody)
where
    B: axum::body::HttpBody<Data = Bytes, Error = axum::Error> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();

    let tapped = body.into_data_stream().map(move |chunk| {
        let side_copy = match &chunk {
            Ok(bytes) => Ok(bytes.clone()),
            Err(e) => {
                error!(error = %e, "body stream failed during capture");
                Err(CaptureError::Stream(e.to_string()))
            }
        };
        let _ = tx.send(side_copy);
        chunk
    });

    let collected = Box::pin(async move {
        let mut buf = BytesMut::new();
        while let Some(chunk) = rx.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    });

    (Body::from_stream(tapped), collected)
}

#[cfg(test)]
mod tests {
    use super::capture_body;
    use axum::body::Body;
    use bytes::Bytes;
    use futures::stream;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn body_flows_through_and_is_captured() {
        let (body, collected) = capture_body(Body::from("hello capture"));

        let passthrough = tokio::spawn(async move { body.collect().await.unwrap().to_bytes() });
        let captured = tokio::spawn(async move { collected.await.unwrap() });

        let (passthrough, captured) = tokio::join!(passthrough, captured);
        assert_eq!(passthrough.unwrap(), "hello capture");
        assert_eq!(captured.unwrap(), "hello capture");
    }

    #[tokio::test]
    async fn chunked_body_is_reassembled() {
        let chunks = stream::iter(vec![
            Ok::<_, std::convert::Infallible>(Bytes::from("part-1/")),
            Ok(Bytes::from("part-2/")),
            Ok(Bytes::from("part-3")),
        ]);
        let (body, collected) = capture_body(Body::from_stream(chunks));

        let passthrough = tokio::spawn(async move { body.collect().await.unwrap().to_bytes() });
        let captured = tokio::spawn(async move { collected.await.unwrap() });

        let (passthrough, captured) = tokio::join!(passthrough, captured);
        assert_eq!(passthrough.unwrap(), "part-1/part-2/part-3");
        assert_eq!(captured.unwrap(), "part-1/part-2/part-3");
    }

    #[tokio::test]
    async fn empty_body_yields_empty_capture() {
        let (body, collected) = capture_body(Body::empty());
        let passthrough = body.collect().await.unwrap().to_bytes();
        assert!(passthrough.is_empty());
        assert!(collected.await.unwrap().is_empty());
    }
}
