//! Request and response body types.
//!
//! `Body` is what the handlers produce: either a single chunk, a
//! generated stream (multistatus, directory listings, file content),
//! or nothing. It implements both `Stream` and `http_body::Body` so it
//! can be handed straight to hyper.
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::stream::Stream;
use http_body::{Body as HttpBody, Frame};

use crate::async_stream::AsyncStream;

/// Body returned by the webdav handlers.
pub struct Body {
    inner: BodyType,
}

enum BodyType {
    Bytes(Option<Bytes>),
    AsyncStream(AsyncStream<Bytes, io::Error>),
    Empty,
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body {
            inner: BodyType::Empty,
        }
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match self.inner {
            BodyType::Bytes(ref mut strm) => Poll::Ready(strm.take().map(Ok)),
            BodyType::AsyncStream(ref mut strm) => Pin::new(strm).poll_next(cx),
            BodyType::Empty => Poll::Ready(None),
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    {
        self.poll_next(cx).map(|opt| opt.map(|res| res.map(Frame::data)))
    }
}

impl From<String> for Body {
    fn from(t: String) -> Body {
        Body {
            inner: BodyType::Bytes(Some(Bytes::from(t))),
        }
    }
}

impl From<&str> for Body {
    fn from(t: &str) -> Body {
        Body {
            inner: BodyType::Bytes(Some(Bytes::from(t.to_string()))),
        }
    }
}

impl From<Bytes> for Body {
    fn from(t: Bytes) -> Body {
        Body {
            inner: BodyType::Bytes(Some(t)),
        }
    }
}

impl From<AsyncStream<Bytes, io::Error>> for Body {
    fn from(s: AsyncStream<Bytes, io::Error>) -> Body {
        Body {
            inner: BodyType::AsyncStream(s),
        }
    }
}

pin_project_lite::pin_project! {
    // Adapter that turns an incoming `http_body::Body` into a plain
    // `Stream` of `Bytes`, skipping trailer frames.
    pub(crate) struct InBody<B> {
        #[pin]
        body: B,
    }
}

impl<B> InBody<B> {
    pub fn from(body: B) -> InBody<B> {
        InBody { body }
    }
}

impl<B, D, E> Stream for InBody<B>
where
    B: HttpBody<Data = D, Error = E>,
    D: Buf + Send,
    E: StdError + Send + Sync + 'static,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match this.body.as_mut().poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    match frame.into_data() {
                        Ok(mut data) => {
                            let bytes = data.copy_to_bytes(data.remaining());
                            return Poll::Ready(Some(Ok(bytes)));
                        },
                        // not a data frame (trailers), skip it.
                        Err(_) => continue,
                    }
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
