//! TCP server for the policy delegation protocol.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{error, info, warn};

use super::connection::handle_connection;
use crate::error::Result;
use crate::ratelimit::PolicyBackend;

/// Pause after a failed accept before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of incoming policy connections.
pub trait Listener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Policy server accepting one request per connection.
pub struct PolicyServer<B: PolicyBackend + ?Sized + 'static, L: Listener = TcpListener> {
    listener: L,
    backend: Arc<B>,
}

impl<B: PolicyBackend + ?Sized + 'static> PolicyServer<B> {
    /// Bind the listening socket.
    pub async fn bind<A: ToSocketAddrs>(addr: A, backend: Arc<B>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, backend })
    }
}

impl<B: PolicyBackend + ?Sized + 'static, L: Listener> PolicyServer<B, L> {
    /// Serve connections from an already open listener.
    pub fn from_listener(listener: L, backend: Arc<B>) -> Self {
        Self { listener, backend }
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `signal` resolves.
    ///
    /// Each connection runs on its own task; a failing connection is logged
    /// and never affects the listener. A failed accept (for example
    /// `EMFILE` or `ECONNABORTED`) is logged and retried after
    /// [`ACCEPT_BACKOFF`].
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Policy server listening");

        tokio::pin!(signal);

        loop {
            let accepted = tokio::select! {
                _ = &mut signal => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(connection) => connection,
                Err(e) => {
                    error!(error = %e, "Cannot accept client, retrying");
                    tokio::select! {
                        _ = &mut signal => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            };
            let backend = Arc::clone(&self.backend);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, backend).await {
                    warn!(peer = %peer, error = %e, "Error handling policy connection");
                }
            });
        }

        info!(addr = %addr, "Policy server stopping");
        Ok(())
    }

    /// Accept connections until the process exits.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Action, KeyValueStore, RateLimiter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn ask(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_server_round_trip_and_shutdown() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(KeyValueStore::new()),
            Arc::new(KeyValueStore::new()),
        ));
        limiter.set_default_limit(2);

        let server = PolicyServer::bind("127.0.0.1:0", limiter.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async move {
            let _ = stop_rx.await;
        }));

        let request = b"sender=a@x.com\nrecipient_count=2\n\n";
        assert_eq!(ask(addr, request).await, Action::Accept.to_response());
        assert_eq!(
            ask(addr, request).await,
            "action=defer_if_permit rate limit exceeded\n\n"
        );

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_error() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(KeyValueStore::new()),
            Arc::new(KeyValueStore::new()),
        ));
        let first = PolicyServer::bind("127.0.0.1:0", limiter.clone()).await.unwrap();
        let addr = first.local_addr().unwrap();

        assert!(PolicyServer::bind(addr, limiter).await.is_err());
    }

    /// Listener whose first `failures` accepts fail.
    struct FlakyListener {
        inner: TcpListener,
        failures: AtomicUsize,
    }

    impl Listener for FlakyListener {
        type Stream = TcpStream;

        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted"));
            }
            self.inner.accept().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_server() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(KeyValueStore::new()),
            Arc::new(KeyValueStore::new()),
        ));
        let listener = FlakyListener {
            inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            failures: AtomicUsize::new(3),
        };
        let server = PolicyServer::from_listener(listener, limiter);
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async move {
            let _ = stop_rx.await;
        }));

        let request = b"sender=a@x.com\nrecipient_count=1\n\n";
        assert_eq!(ask(addr, request).await, Action::Accept.to_response());
        assert_eq!(ask(addr, request).await, Action::Accept.to_response());

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_accept_backoff() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(KeyValueStore::new()),
            Arc::new(KeyValueStore::new()),
        ));
        let listener = FlakyListener {
            inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            failures: AtomicUsize::new(usize::MAX),
        };
        let server = PolicyServer::from_listener(listener, limiter);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve_with_shutdown(tokio::time::sleep(ACCEPT_BACKOFF * 3)),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
