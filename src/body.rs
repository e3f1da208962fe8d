//! The response body type returned by the webdav handler.
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream};
use http_body::Frame;

/// Response body. Implements both `Stream` and `http_body::Body`.
pub struct Body {
    inner: BodyType,
}

enum BodyType {
    Empty,
    Bytes(Option<Bytes>),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    /// Return an empty body.
    pub fn empty() -> Body {
        Body {
            inner: BodyType::Empty,
        }
    }

    /// Build a body from a stream of byte chunks.
    pub fn from_stream<S>(s: S) -> Body
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body {
            inner: BodyType::Stream(Box::pin(s)),
        }
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().inner {
            BodyType::Empty => Poll::Ready(None),
            BodyType::Bytes(ref mut b) => Poll::Ready(b.take().map(Ok)),
            BodyType::Stream(ref mut s) => s.as_mut().poll_next(cx),
        }
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        <Body as Stream>::poll_next(self, cx).map(|opt| opt.map(|res| res.map(Frame::data)))
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            BodyType::Empty => true,
            BodyType::Bytes(ref b) => b.is_none(),
            BodyType::Stream(_) => false,
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Body {
        Body {
            inner: BodyType::Bytes(Some(b)),
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Body {
        Body::from(Bytes::from(s.to_string()))
    }
}
