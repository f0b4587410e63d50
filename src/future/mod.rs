// src/future/mod.rs

//! The `Future<T>`/`Promise<T>` pair `run_async` hands back to callers
//! (spec §4.4). Grounded on `tokio::sync::oneshot`, the same primitive the
//! teacher uses for its own one-shot reply channels (`core/tasks/*`); this
//! module just gives the pair proclet-flavored names and a uniform error
//! type instead of exposing the raw channel.

use crate::error::{NuError, NuResult};
use tokio::sync::oneshot;

/// The write end of a future, held by whichever task is computing the
/// result. Consumed by exactly one [`Future::await`] on the other side.
pub struct Promise<T> {
    tx: oneshot::Sender<NuResult<T>>,
}

impl<T> Promise<T> {
    pub fn fulfill(self, value: NuResult<T>) {
        // The receiver may already be gone (caller dropped the future
        // without awaiting it); that is not an error for the producer.
        let _ = self.tx.send(value);
    }
}

/// A handle to a result that may not be ready yet. Unlike a raw
/// `oneshot::Receiver`, awaiting a dropped promise yields a `NuError`
/// instead of a channel-specific error, matching every other fallible
/// operation in this crate.
pub struct Future<T> {
    rx: oneshot::Receiver<NuResult<T>>,
}

impl<T> Future<T> {
    pub fn pair() -> (Promise<T>, Future<T>) {
        let (tx, rx) = oneshot::channel();
        (Promise { tx }, Future { rx })
    }
}

impl<T> std::future::Future for Future<T> {
    type Output = NuResult<T>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        match std::pin::Pin::new(&mut this.rx).poll(cx) {
            std::task::Poll::Ready(Ok(v)) => std::task::Poll::Ready(v),
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(NuError::Internal(
                "promise dropped without being fulfilled".into(),
            ))),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfilled_promise_resolves_its_future() {
        let (p, f) = Future::<i32>::pair();
        p.fulfill(Ok(42));
        assert_eq!(f.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn dropped_promise_resolves_to_an_error() {
        let (p, f) = Future::<i32>::pair();
        drop(p);
        assert!(f.await.is_err());
    }
}
