//! Streaming body plumbing: the response body type handed to hyper, the
//! block-assembling write-through reader and the composite segment reader
//! used by the range composer.

pub mod block_sink;
pub mod compose;

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body::{Frame, SizeHint};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Default block size when neither config nor an existing record says
/// otherwise: 32 KiB.
pub const DEFAULT_SLICE_SIZE: u64 = 32 * 1024;

/// Response body: either a buffered payload or a byte stream. A stream
/// error aborts the body; hyper closes the connection so the client never
/// sees interleaved partial bytes as a complete reply.
pub struct ProxyBody {
    kind: BodyKind,
}

enum BodyKind {
    Full(Option<Bytes>),
    Stream(BoxStream<'static, Result<Bytes, BoxError>>),
}

impl ProxyBody {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Full(None),
        }
    }

    pub fn full(bytes: Bytes) -> Self {
        let kind = if bytes.is_empty() {
            BodyKind::Full(None)
        } else {
            BodyKind::Full(Some(bytes))
        };
        Self { kind }
    }

    pub fn text(body: &str) -> Self {
        Self::full(Bytes::from(body.to_string()))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            kind: BodyKind::Stream(stream.boxed()),
        }
    }
}

impl http_body::Body for ProxyBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match &mut self.get_mut().kind {
            BodyKind::Full(slot) => Poll::Ready(slot.take().map(|b| Ok(Frame::data(b)))),
            BodyKind::Stream(stream) => match stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.kind, BodyKind::Full(None))
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            BodyKind::Full(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            BodyKind::Full(None) => SizeHint::with_exact(0),
            BodyKind::Stream(_) => SizeHint::default(),
        }
    }
}
