//! Server lifecycle: binding, connection timeouts, and bounded graceful
//! shutdown.
//!
//! [`run_server`] runs `axum::serve` on its own task and waits for the
//! shutdown future. Once it resolves, the server stops accepting and
//! in-flight requests get [`ServerTimeouts::shutdown_grace`] to finish.
//! Connections still open after that are torn down and the outcome is
//! [`ShutdownOutcome::Forced`].
//!
//! Per-connection timeouts:
//! - read: a request's head must arrive within [`ServerTimeouts::read`] of its
//!   first byte (of the accept, for the first request), and body frames within
//!   the same window of each other
//! - write: handlers must produce a response within [`ServerTimeouts::write`],
//!   otherwise the client gets 503
//! - idle: a connection with no reads or writes for [`ServerTimeouts::idle`]
//!   is closed

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::serve::{IncomingStream, Listener};
use axum::Router;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;
use tokio::time::{sleep, Instant, Sleep};
use tower_http::timeout::RequestBodyTimeoutLayer;
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::error::ServiceError;

/// Connection and shutdown timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimeouts {
    /// Deadline for receiving a request head, and between body frames.
    pub read: Duration,
    /// Deadline for a handler to produce its response.
    pub write: Duration,
    /// Maximum quiet time on a connection.
    pub idle: Duration,
    /// Hard ceiling on draining in-flight requests after shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerTimeouts {
    /// Wrap every route of `router` in the read and write deadlines.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router
            .layer(middleware::from_fn_with_state(
                self.write,
                enforce_write_deadline,
            ))
            .layer(RequestBodyTimeoutLayer::new(self.read))
    }
}

async fn enforce_write_deadline(
    State(limit): State<Duration>,
    ctx: RequestContext,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ServiceError::WriteTimeout { limit }.report(&ctx),
    }
}

/// Peer address of an accepted connection, available to handlers as
/// `ConnectInfo<ClientAddr>`.
///
/// Connections accepted by [`run_server`] also carry the handle that stops
/// their request read deadline once a request head has been parsed.
#[derive(Debug, Clone)]
pub struct ClientAddr {
    addr: SocketAddr,
    read_deadline: Option<ReadDeadline>,
}

impl ClientAddr {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn request_received(&self) {
        if let Some(deadline) = &self.read_deadline {
            deadline.disarm();
        }
    }
}

impl From<SocketAddr> for ClientAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr,
            read_deadline: None,
        }
    }
}

impl std::fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.addr.fmt(f)
    }
}

impl Connected<IncomingStream<'_, GuardedListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, GuardedListener>) -> Self {
        Self {
            addr: *stream.remote_addr(),
            read_deadline: Some(stream.io().read_deadline.clone()),
        }
    }
}

impl Connected<IncomingStream<'_, TcpListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self::from(*stream.remote_addr())
    }
}

/// Stop the connection's read deadline: the request head has arrived.
async fn release_read_deadline(request: Request, next: Next) -> Response {
    if let Some(ConnectInfo(client)) = request.extensions().get::<ConnectInfo<ClientAddr>>() {
        client.request_received();
    }
    next.run(request).await
}

/// How the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request finished inside the grace window.
    Graceful,
    /// The grace window elapsed and remaining connections were dropped.
    Forced,
}

/// Fatal lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),

    #[error("server task failed: {0}")]
    Join(#[from] JoinError),
}

/// Bind `0.0.0.0:port`.
pub async fn bind_listener(port: u16) -> Result<TcpListener, LifecycleError> {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .map_err(|source| LifecycleError::Bind { port, source })
}

/// Serve `router` on `listener` until `shutdown` resolves, then drain.
///
/// Handlers can extract `ConnectInfo<ClientAddr>`.
pub async fn run_server<F>(
    listener: TcpListener,
    router: Router,
    timeouts: ServerTimeouts,
    shutdown: F,
) -> Result<ShutdownOutcome, LifecycleError>
where
    F: Future<Output = ()>,
{
    let (abort_tx, abort_rx) = watch::channel(false);
    let (drain_tx, drain_rx) = oneshot::channel::<()>();

    let listener = GuardedListener::new(listener, timeouts, abort_rx);
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Server listening");
    }

    let router = router.layer(middleware::from_fn(release_read_deadline));
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<ClientAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = drain_rx.await;
    });
    let mut handle = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut handle => {
            // Stopped before any shutdown was requested.
            return match joined {
                Ok(Ok(())) => Ok(ShutdownOutcome::Graceful),
                Ok(Err(err)) => Err(LifecycleError::Serve(err)),
                Err(err) => Err(LifecycleError::Join(err)),
            };
        }
        () = shutdown => {}
    }

    info!(
        grace_period_secs = timeouts.shutdown_grace.as_secs_f64(),
        "Initiating graceful shutdown"
    );
    let _ = drain_tx.send(());

    match tokio::time::timeout(timeouts.shutdown_grace, &mut handle).await {
        Ok(Ok(Ok(()))) => {
            info!("Server shutdown completed successfully");
            Ok(ShutdownOutcome::Graceful)
        }
        Ok(Ok(Err(err))) => Err(LifecycleError::Serve(err)),
        Ok(Err(err)) => Err(LifecycleError::Join(err)),
        Err(_) => {
            handle.abort();
            let _ = abort_tx.send(true);
            error!(
                grace_period_secs = timeouts.shutdown_grace.as_secs_f64(),
                "Server forced to shutdown"
            );
            Ok(ShutdownOutcome::Forced)
        }
    }
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(signal = "SIGINT", "Received shutdown signal");
        }
        _ = terminate => {
            info!(signal = "SIGTERM", "Received shutdown signal");
        }
    }
}

// =============================================================================
// GuardedListener - read and idle timeouts, forced teardown per connection
// =============================================================================

/// TCP listener whose connections close when a request head is too slow,
/// when idle, or when the server is forced down.
pub struct GuardedListener {
    inner: TcpListener,
    read: Duration,
    idle: Duration,
    abort: watch::Receiver<bool>,
}

impl GuardedListener {
    /// Connections fail once `abort` turns `true`.
    pub fn new(inner: TcpListener, timeouts: ServerTimeouts, abort: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            read: timeouts.read,
            idle: timeouts.idle,
            abort,
        }
    }
}

impl Listener for GuardedListener {
    type Io = GuardedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    let stream =
                        GuardedStream::new(stream, self.read, self.idle, self.abort.clone());
                    return (stream, addr);
                }
                Err(err) => {
                    if is_connection_error(&err) {
                        continue;
                    }
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!(error = %err, "Failed to accept connection");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

type AbortFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Whether a connection is waiting for its next request head.
///
/// The stream sets it after writing a response; [`release_read_deadline`]
/// clears it when the router receives the request.
#[derive(Debug, Clone)]
struct ReadDeadline(Arc<AtomicBool>);

impl ReadDeadline {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn arm(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn disarm(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Accepted connection produced by [`GuardedListener`].
///
/// Every read or write that makes progress pushes the idle deadline out.
/// A request head must be complete within the read timeout, counted from
/// the accept for the first request and from the first byte after a
/// response for later ones.
pub struct GuardedStream {
    inner: TcpStream,
    read: Duration,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    read_deadline: ReadDeadline,
    head_timer: Pin<Box<Sleep>>,
    head_started: bool,
    abort: AbortFuture,
    aborted: bool,
}

impl GuardedStream {
    fn new(
        inner: TcpStream,
        read: Duration,
        idle: Duration,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner,
            read,
            idle,
            deadline: Box::pin(sleep(idle)),
            read_deadline: ReadDeadline::new(),
            head_timer: Box::pin(sleep(read)),
            head_started: true,
            abort: Box::pin(wait_for_abort(abort)),
            aborted: false,
        }
    }

    /// Fail if the server was forced down, the request head is overdue, or
    /// the connection went quiet.
    fn poll_guard(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if !self.aborted && self.abort.as_mut().poll(cx).is_ready() {
            self.aborted = true;
        }
        if self.aborted {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "server shut down",
            ));
        }

        if self.head_started
            && self.read_deadline.is_armed()
            && self.head_timer.as_mut().poll(cx).is_ready()
        {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "request read timeout",
            ));
        }

        if self.deadline.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle timeout",
            ));
        }

        Ok(())
    }

    fn touch(&mut self) {
        let next = Instant::now() + self.idle;
        self.deadline.as_mut().reset(next);
    }

    /// Start the head timer on the first byte of a new request.
    fn on_read(&mut self, read: usize) {
        if read > 0 && !self.head_started && self.read_deadline.is_armed() {
            self.head_started = true;
            let next = Instant::now() + self.read;
            self.head_timer.as_mut().reset(next);
        }
        self.touch();
    }

    /// A response is going out; the next bytes read belong to a new request.
    fn on_write(&mut self) {
        self.read_deadline.arm();
        self.head_started = false;
        self.touch();
    }
}

async fn wait_for_abort(mut abort: watch::Receiver<bool>) {
    let fired = abort.wait_for(|aborted| *aborted).await.is_ok();
    if !fired {
        // Sender dropped after a graceful stop; never abort.
        std::future::pending::<()>().await;
    }
}

impl AsyncRead for GuardedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.poll_guard(cx)?;

        let before = buf.filled().len();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        this.on_read(buf.filled().len() - before);
        Poll::Ready(result)
    }
}

impl AsyncWrite for GuardedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.poll_guard(cx)?;

        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
        this.on_write();
        Poll::Ready(result)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.poll_guard(cx)?;

        let result = ready!(Pin::new(&mut this.inner).poll_write_vectored(cx, bufs));
        this.on_write();
        Poll::Ready(result)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum_test::TestServer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_default_timeouts() {
        let timeouts = ServerTimeouts::default();
        assert_eq!(timeouts.read, Duration::from_secs(5));
        assert_eq!(timeouts.write, Duration::from_secs(10));
        assert_eq!(timeouts.idle, Duration::from_secs(15));
        assert_eq!(timeouts.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_connection_errors_are_retried() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_connection_error(&io::Error::other("too many open files")));
    }

    #[test]
    fn test_lifecycle_error_display() {
        let err = LifecycleError::Bind {
            port: 8080,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("8080"));
    }

    #[tokio::test]
    async fn test_write_deadline_returns_503() {
        let timeouts = ServerTimeouts {
            write: Duration::from_millis(50),
            ..ServerTimeouts::default()
        };
        let app = timeouts.apply(
            Router::new()
                .route("/fast", get(|| async { "done" }))
                .route(
                    "/slow",
                    get(|| async {
                        sleep(Duration::from_secs(2)).await;
                        "late"
                    }),
                ),
        );
        let server = TestServer::new(app).unwrap();

        server.get("/fast").await.assert_text("done");

        let response = server.get("/slow").await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        response.assert_text("Handler exceeded write timeout");
    }

    fn timeouts(read: Duration, idle: Duration) -> ServerTimeouts {
        ServerTimeouts {
            read,
            idle,
            ..ServerTimeouts::default()
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_listener(port).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Bind { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_abort_tx, abort_rx) = watch::channel(false);
        let mut guarded = GuardedListener::new(
            listener,
            timeouts(Duration::from_secs(30), Duration::from_millis(100)),
            abort_rx,
        );

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            // Stay connected without talking.
            sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let (mut conn, _) = guarded.accept().await;
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_fails_open_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (abort_tx, abort_rx) = watch::channel(false);
        let mut guarded = GuardedListener::new(
            listener,
            timeouts(Duration::from_secs(30), Duration::from_secs(30)),
            abort_rx,
        );

        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut conn, _) = guarded.accept().await;

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            conn.read(&mut buf).await
        });
        sleep(Duration::from_millis(50)).await;
        abort_tx.send(true).unwrap();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_slow_request_head_is_cut_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_abort_tx, abort_rx) = watch::channel(false);
        let mut guarded = GuardedListener::new(
            listener,
            timeouts(Duration::from_millis(200), Duration::from_secs(30)),
            abort_rx,
        );

        let _client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for _ in 0..20 {
                if stream.write_all(b"X-Slow: 1\r\n").await.is_err() {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
        });

        let (mut conn, _) = guarded.accept().await;
        let mut buf = [0u8; 64];
        let err = loop {
            match conn.read(&mut buf).await {
                Ok(n) => assert!(n > 0, "client closed before the deadline"),
                Err(err) => break err,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_released_head_deadline_allows_slow_handlers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_abort_tx, abort_rx) = watch::channel(false);
        let mut guarded = GuardedListener::new(
            listener,
            timeouts(Duration::from_millis(100), Duration::from_secs(30)),
            abort_rx,
        );

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"head").await.unwrap();
            sleep(Duration::from_millis(300)).await;
            stream.write_all(b"more").await.unwrap();
            sleep(Duration::from_millis(100)).await;
        });

        let (mut conn, _) = guarded.accept().await;
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        conn.read_deadline.disarm();

        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
        client.await.unwrap();
    }
}
