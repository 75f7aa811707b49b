//! Produce a `Stream` from an async block.
//!
//! The closure gets a `Sender`; every `tx.send(item).await` yields one
//! item on the stream. When the closure's future completes the stream
//! ends (or yields the error the closure returned).
//!
//! This is how the handlers stream multistatus bodies and file content
//! without buffering them.
use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_util::Stream;

/// Future returned by `Sender::send()`. Completes when the item is picked up.
#[must_use]
pub struct SenderFuture {
    is_ready: bool,
}

impl SenderFuture {
    fn new() -> SenderFuture {
        SenderFuture { is_ready: false }
    }
}

impl Future for SenderFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_ready {
            Poll::Ready(())
        } else {
            self.is_ready = true;
            Poll::Pending
        }
    }
}

// Only shared between one AsyncStream and the future it owns, which
// never run concurrently, so no Arc<Mutex> is needed.
/// One-item handoff slot passed into the async closure.
pub struct Sender<I, E>(Rc<Cell<Option<I>>>, PhantomData<E>);
unsafe impl<I: Sync, E: Sync> Sync for Sender<I, E> {}
unsafe impl<I: Send, E: Send> Send for Sender<I, E> {}

impl<I, E> Sender<I, E> {
    fn new(item_opt: Option<I>) -> Sender<I, E> {
        Sender(Rc::new(Cell::new(item_opt)), PhantomData::<E>)
    }

    // private clone, this is not `impl Clone`.
    fn dup(&self) -> Sender<I, E> {
        Sender(self.0.clone(), PhantomData::<E>)
    }

    /// Send one item to the stream.
    pub fn send<T>(&mut self, item: T) -> SenderFuture
    where T: Into<I> {
        self.0.set(Some(item.into()));
        SenderFuture::new()
    }
}

/// A stream produced by an async closure.
#[must_use]
pub struct AsyncStream<Item, Error> {
    item: Sender<Item, Error>,
    fut:  Option<Pin<Box<dyn Future<Output = Result<(), Error>> + 'static + Send>>>,
}

impl<Item, Error: 'static + Send> AsyncStream<Item, Error> {
    /// Create a new stream from an async closure.
    pub fn new<F, R>(f: F) -> Self
    where
        F: FnOnce(Sender<Item, Error>) -> R,
        R: Future<Output = Result<(), Error>> + Send + 'static,
        Item: 'static,
    {
        let sender = Sender::new(None);
        AsyncStream::<Item, Error> {
            item: sender.dup(),
            fut:  Some(Box::pin(f(sender))),
        }
    }
}

impl<I, E: Unpin> Stream for AsyncStream<I, E> {
    type Item = Result<I, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<I, E>>> {
        let pollres = {
            let fut = self.fut.as_mut().unwrap();
            fut.as_mut().poll(cx)
        };
        match pollres {
            // Future is done, so is the stream.
            Poll::Ready(Ok(_)) => Poll::Ready(None),
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => {
                // Pending might come from the SenderFuture of Sender::send,
                // in which case an item is waiting in the slot.
                match self.item.0.replace(None) {
                    Some(item) => Poll::Ready(Some(Ok(item))),
                    None => Poll::Pending,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn stream_items() {
        let mut strm = AsyncStream::<u8, std::io::Error>::new(|mut tx| {
            async move {
                for i in 0u8..10 {
                    tx.send(i).await;
                }
                Ok(())
            }
        });
        futures_executor::block_on(async {
            let mut count = 0;
            while let Some(item) = strm.next().await {
                assert_eq!(item.unwrap(), count);
                count += 1;
            }
            assert_eq!(count, 10);
        });
    }
}
