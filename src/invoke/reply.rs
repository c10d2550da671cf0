//! Channel-backed handles for asynchronous and streaming calls.
//!
//! Call results are delivered as typed values over channels fed by
//! pool-managed tasks, never inline on the thread that issued the call.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::codec::Marshal;
use crate::error::Error;

/// Pending outcome of an asynchronous call. Exactly one terminal value is
/// delivered.
pub struct Reply<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Reply<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T, Error>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Await the outcome. A dispatch task that disappeared without answering
    /// reads as a cancelled call.
    pub async fn recv(self) -> Result<T, Error> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// One delivery on a server stream.
#[derive(Debug)]
pub enum StreamEvent<T> {
    /// The next response, in server emission order.
    Next(T),
    /// The server finished the stream normally.
    Completed,
    /// The stream ended in failure. Terminal; `Completed` will not follow.
    Failed(Error),
}

/// Receiving side of a server-streaming call. Yields zero or more `Next`
/// events terminated by exactly one `Completed` or `Failed`.
pub struct StreamReply<T> {
    rx: mpsc::UnboundedReceiver<StreamEvent<T>>,
}

impl<T> StreamReply<T> {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<StreamEvent<T>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next(&mut self) -> Option<StreamEvent<T>> {
        self.rx.recv().await
    }
}

/// Caller side of a client-streaming call: push requests, then close to
/// signal end-of-input to the remote peer.
pub struct RequestSink<T: Marshal> {
    tx: Option<mpsc::Sender<Bytes>>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Marshal> RequestSink<T> {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Some(tx),
                _marker: std::marker::PhantomData,
            },
            rx,
        )
    }

    /// Push one request message.
    pub async fn send(&self, request: &T) -> Result<(), Error> {
        let payload = request.to_bytes()?;
        let tx = self.tx.as_ref().ok_or(Error::Cancelled)?;
        tx.send(payload).await.map_err(|_| Error::Cancelled)
    }

    /// Signal end-of-input. Dropping the sink without calling this has the
    /// same effect.
    pub fn close(mut self) {
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_delivers_once() {
        let (tx, reply) = Reply::<u32>::channel();
        tx.send(Ok(7)).unwrap();
        assert_eq!(reply.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_dispatch_reads_as_cancelled() {
        let (tx, reply) = Reply::<u32>::channel();
        drop(tx);
        assert!(matches!(reply.recv().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_sink_close_ends_input() {
        let (sink, mut rx) = RequestSink::<String>::channel(4);
        sink.send(&"one".to_string()).await.unwrap();
        sink.close();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sink_send_after_peer_gone() {
        let (sink, rx) = RequestSink::<String>::channel(1);
        drop(rx);
        assert!(matches!(
            sink.send(&"x".to_string()).await,
            Err(Error::Cancelled)
        ));
    }
}
