//! Bounded hand-off queue between an accept loop and its consumer.
//!
//! # Data Flow
//! ```text
//! inner.accept() ─▶ spawn prepare(conn) ─▶ bounded queue ─▶ Handoff::accept()
//! ```
//!
//! # Design Decisions
//! - Slow per-connection preparation (sniffing, handshakes) never blocks accept
//! - The first listener error is forwarded once and ends the loop; a peer
//!   that resets before accept completes is skipped
//! - Closing stops the loop; connections still being prepared are discarded

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};

use crate::net::listener::{is_connection_error, StreamListener};

type Accepted<T> = io::Result<(T, SocketAddr)>;

/// Accept queue fed by a background loop over an inner listener.
pub struct Handoff<T> {
    queue: mpsc::Receiver<Accepted<T>>,
    closed: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl<T: Send + 'static> Handoff<T> {
    /// Start the accept loop.
    ///
    /// `prepare` runs on its own task per connection; returning `None`
    /// drops the connection without surfacing anything to the consumer.
    pub fn spawn<L, F, Fut>(mut inner: L, capacity: usize, prepare: F) -> io::Result<Self>
    where
        L: StreamListener,
        F: Fn(L::Io, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<(T, SocketAddr)>> + Send + 'static,
    {
        let local_addr = inner.local_addr()?;
        let (tx, queue) = mpsc::channel(capacity.max(1));
        let (closed, mut closed_rx) = watch::channel(false);

        tokio::spawn(async move {
            let prepare = std::sync::Arc::new(prepare);
            loop {
                let accepted = tokio::select! {
                    _ = closed_rx.wait_for(|closed| *closed) => break,
                    accepted = inner.accept() => accepted,
                };

                match accepted {
                    Ok((io, remote)) => {
                        let tx = tx.clone();
                        let prepare = prepare.clone();
                        tokio::spawn(async move {
                            if let Some(ready) = prepare(io, remote).await {
                                // The consumer may already be gone.
                                let _ = tx.send(Ok(ready)).await;
                            }
                        });
                    }
                    Err(e) if is_connection_error(&e) => {
                        tracing::debug!(error = %e, "Connection failed during accept");
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            queue,
            closed,
            local_addr,
        })
    }
}

impl<T> Handoff<T> {
    /// Next prepared connection, or the error that stopped the loop.
    ///
    /// Once closed, only connections already queued are returned; after
    /// that every call reports `BrokenPipe`.
    pub async fn accept(&mut self) -> Accepted<T> {
        let mut closed = self.closed.subscribe();
        if !*closed.borrow_and_update() {
            tokio::select! {
                biased;
                accepted = self.queue.recv() => return accepted.unwrap_or_else(|| Err(stopped())),
                _ = closed.changed() => {}
            }
        }
        self.queue.try_recv().unwrap_or_else(|_| Err(stopped()))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop and release the inner listener.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "listener accept loop has stopped")
}

impl<T> Drop for Handoff<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    /// Fails every accept with the same error.
    struct Failing(io::ErrorKind);

    impl StreamListener for Failing {
        type Io = TcpStream;

        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            Err(io::Error::from(self.0))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    #[tokio::test]
    async fn listener_error_is_forwarded_once_then_loop_stops() {
        let mut handoff = Handoff::spawn(
            Failing(io::ErrorKind::PermissionDenied),
            4,
            |io, remote| async move { Some((io, remote)) },
        )
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(3), handoff.accept())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(first.kind(), io::ErrorKind::PermissionDenied);

        let second = tokio::time::timeout(Duration::from_secs(3), handoff.accept())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(second.kind(), io::ErrorKind::BrokenPipe);
    }
}
