//! Command queue and response correlation
//!
//! The receiver answers every command with one `\r`-terminated line, but it
//! also emits status lines on its own and sometimes says nothing at all. This
//! module keeps exactly one command on the wire at a time and pairs each
//! received line with the command that is waiting for it, by send order only.
//!
//! # Architecture
//!
//! One tokio task (the engine) owns the [`Transport`] and a [`Correlator`].
//! Every state change goes through that task's `select!` loop:
//!
//! 1. Shutdown
//! 2. Received lines
//! 3. Response deadline
//! 4. New requests from [`CommandQueue::send`]
//!
//! Requests arrive over an unbounded channel, so `send` never blocks and the
//! engine sees them in submission order. A line that arrives while nothing is
//! outstanding is unsolicited: it is published to
//! [`CommandQueue::subscribe_unsolicited`] and otherwise ignored.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ProtocolError, Result, Transport, DEFAULT_TIMEOUT_MS};

/// Default capacity of the unsolicited line broadcast channel
const DEFAULT_EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Command queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long to wait for a response line before skipping a command
    pub response_timeout: Duration,
    /// Number of unsolicited lines buffered per subscriber
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

type Callback = Box<dyn FnOnce(Result<String>) + Send + 'static>;

/// Where a request's outcome is delivered.
enum Responder {
    Reply(oneshot::Sender<Result<String>>),
    Callback(Callback),
}

impl Responder {
    fn resolve(self, result: Result<String>) {
        match self {
            Responder::Reply(tx) => {
                // The caller may have stopped waiting.
                let _ = tx.send(result);
            }
            Responder::Callback(callback) => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    tracing::error!("Response callback panicked");
                }
            }
        }
    }
}

/// A command waiting to be sent, or waiting for its response.
///
/// Resolving consumes the request. A request dropped before it was resolved
/// reports [`ProtocolError::ConnectionClosed`], so every caller hears back
/// exactly once.
pub(crate) struct Request {
    command: String,
    responder: Option<Responder>,
}

impl Request {
    fn new(command: String, responder: Responder) -> Self {
        Self {
            command,
            responder: Some(responder),
        }
    }

    /// Command text without its terminator, for logs and errors
    fn label(&self) -> &str {
        self.command.trim()
    }

    fn resolve(mut self, result: Result<String>) {
        if let Some(responder) = self.responder.take() {
            responder.resolve(result);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            responder.resolve(Err(ProtocolError::ConnectionClosed));
        }
    }
}

/// The request currently on the wire.
struct Outstanding {
    request: Request,
    /// Set when the command is handed to the transport
    deadline: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Queue and outstanding-slot state, owned by the engine task.
///
/// The correlator never touches the transport: it decides what to write next
/// and who a line belongs to, and the engine performs the IO. The system is
/// busy exactly when a request occupies the outstanding slot.
pub(crate) struct Correlator {
    queue: VecDeque<Request>,
    outstanding: Option<Outstanding>,
    timeout: Duration,
}

impl Correlator {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            outstanding: None,
            timeout,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Number of requests waiting behind the outstanding one
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Deadline of the outstanding request, once armed
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().and_then(|o| o.deadline)
    }

    /// Append a request. Returns `true` when the queue was idle and the
    /// caller must dispatch.
    pub(crate) fn submit(&mut self, request: Request) -> bool {
        debug!(command = %request.label(), "Pushing command on to queue");
        self.queue.push_back(request);
        if self.is_busy() {
            debug!(queued = self.queue.len(), "Currently busy");
            return false;
        }
        true
    }

    /// Move the head of the queue into the outstanding slot and return the
    /// command text to write. Returns `None` and goes idle if the queue is
    /// empty.
    pub(crate) fn dispatch_next(&mut self) -> Option<String> {
        debug_assert!(self.outstanding.is_none(), "dispatch while busy");
        let request = self.queue.pop_front()?;
        let command = request.command.clone();
        self.outstanding = Some(Outstanding {
            request,
            deadline: None,
        });
        Some(command)
    }

    /// Start the response timer for the outstanding request, replacing any
    /// previous deadline.
    pub(crate) fn arm(&mut self, now: Instant) {
        if let Some(outstanding) = self.outstanding.as_mut() {
            outstanding.deadline = Some(now + self.timeout);
        }
    }

    /// Hand a received line to the outstanding request.
    ///
    /// Returns the line back if nothing was waiting for it.
    pub(crate) fn on_line(&mut self, line: String) -> std::result::Result<(), String> {
        let Some(outstanding) = self.outstanding.take() else {
            return Err(line);
        };
        debug!(
            line = %line,
            command = %outstanding.request.label(),
            "Got data, resolving outstanding command"
        );
        outstanding.request.resolve(Ok(line));
        Ok(())
    }

    /// Expire the outstanding request if its deadline has passed.
    ///
    /// Returns `true` if a request was timed out and the caller must
    /// dispatch.
    pub(crate) fn on_deadline(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {}
            _ => return false,
        }
        let Some(outstanding) = self.outstanding.take() else {
            return false;
        };
        let command = outstanding.request.label().to_string();
        tracing::warn!(
            command = %command,
            timeout_ms = self.timeout.as_millis() as u64,
            "Command timed out, skipping"
        );
        outstanding.request.resolve(Err(ProtocolError::Timeout {
            command,
            elapsed: self.timeout,
        }));
        true
    }

    /// Resolve the outstanding request with `error`.
    pub(crate) fn fail_outstanding(&mut self, error: ProtocolError) {
        if let Some(outstanding) = self.outstanding.take() {
            outstanding.request.resolve(Err(error));
        }
    }

    /// Fail the outstanding request and everything queued behind it.
    pub(crate) fn close(&mut self) {
        self.fail_outstanding(ProtocolError::ConnectionClosed);
        for request in self.queue.drain(..) {
            request.resolve(Err(ProtocolError::ConnectionClosed));
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the command engine for one connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct CommandQueue {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CommandQueue {
    /// Spawn the engine task on the current tokio runtime.
    pub fn spawn(transport: Transport, config: QueueConfig) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            transport,
            rx,
            events.clone(),
            config.response_timeout,
            cancel.clone(),
        ));

        Self {
            requests,
            events,
            cancel,
            task,
        }
    }

    /// Queue a command and return a future for its response line.
    ///
    /// The command must include its trailing `\r`. It is written when every
    /// earlier command has been answered or has timed out. Dropping the
    /// returned future does not remove the command from the queue.
    pub fn send(&self, command: impl Into<String>) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::new(command.into(), Responder::Reply(tx)));
        PendingResponse { rx }
    }

    /// Queue a command and invoke `callback` exactly once with the outcome.
    ///
    /// The callback runs on the engine task and must not block. A panic in
    /// the callback is caught and logged; the engine keeps running.
    pub fn send_with<F>(&self, command: impl Into<String>, callback: F)
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        self.submit(Request::new(
            command.into(),
            Responder::Callback(Box::new(callback)),
        ));
    }

    /// Queue a command and wait for its response line.
    pub async fn request(&self, command: impl Into<String>) -> Result<String> {
        self.send(command).await
    }

    /// Receive lines that arrived while no command was outstanding.
    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    /// Whether the engine has stopped accepting commands
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Stop the engine. Outstanding and queued commands fail with
    /// [`ProtocolError::ConnectionClosed`].
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    fn submit(&self, request: Request) {
        if let Err(mpsc::error::SendError(request)) = self.requests.send(request) {
            debug!(command = %request.label(), "Command queue closed, rejecting");
            request.resolve(Err(ProtocolError::ConnectionClosed));
        }
    }
}

/// Response to a queued command. Resolves to the received line or an error.
#[must_use = "the response is lost unless awaited"]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<String>>,
}

impl Future for PendingResponse {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ProtocolError::ConnectionClosed)))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The engine loop. Runs as a spawned tokio task until shutdown, until the
/// connection ends, or until every handle is dropped and the queue drains.
async fn run(
    mut transport: Transport,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: broadcast::Sender<String>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut correlator = Correlator::new(timeout);
    let mut accepting = true;

    loop {
        if !accepting && !correlator.is_busy() {
            debug!("All command queue handles dropped, stopping");
            break;
        }
        let deadline = correlator.deadline();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Command queue shutdown requested");
                break;
            }

            line = transport.next_line() => match line {
                Some(Ok(line)) => match correlator.on_line(line) {
                    Ok(()) => {
                        if !dispatch(&mut correlator, &mut transport, &cancel).await {
                            break;
                        }
                    }
                    Err(line) => {
                        debug!(line = %line, "Ignoring unsolicited line");
                        // No subscribers is fine.
                        let _ = events.send(line);
                    }
                },
                Some(Err(e)) => {
                    tracing::error!(port = %transport.name(), error = %e, "Connection failed");
                    break;
                }
                None => {
                    tracing::warn!(port = %transport.name(), "Connection closed");
                    break;
                }
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if correlator.on_deadline(Instant::now())
                    && !dispatch(&mut correlator, &mut transport, &cancel).await
                {
                    break;
                }
            }

            request = requests.recv(), if accepting => match request {
                Some(request) => {
                    if correlator.submit(request)
                        && !dispatch(&mut correlator, &mut transport, &cancel).await
                    {
                        break;
                    }
                }
                None => accepting = false,
            },
        }
    }

    requests.close();
    correlator.close();
    while let Ok(request) = requests.try_recv() {
        request.resolve(Err(ProtocolError::ConnectionClosed));
    }
    transport.close().await;
}

/// Write queued commands until one is on the wire or the queue is empty.
///
/// The response deadline is armed before the write starts, so a write that
/// stalls times out like a missing response. A failed write resolves that
/// request and moves on. Returns `false` if shutdown was requested while a
/// write was in progress.
async fn dispatch(
    correlator: &mut Correlator,
    transport: &mut Transport,
    cancel: &CancellationToken,
) -> bool {
    while let Some(command) = correlator.dispatch_next() {
        tracing::info!(
            port = %transport.name(),
            command = %command.trim(),
            queued = correlator.queued(),
            "Sending command"
        );
        let now = Instant::now();
        correlator.arm(now);
        let deadline = correlator.deadline().unwrap_or(now);

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            written = tokio::time::timeout_at(deadline, transport.write(&command)) => written,
        };
        match written {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => {
                tracing::error!(command = %command.trim(), error = %e, "Failed to write command");
                correlator.fail_outstanding(e);
            }
            Err(_) => {
                tracing::error!(command = %command.trim(), "Write did not complete");
                correlator.on_deadline(deadline);
            }
        }
    }
    debug!("Command queue idle");
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request(command: &str) -> (Request, oneshot::Receiver<Result<String>>) {
        let (tx, rx) = oneshot::channel();
        (Request::new(command.to_string(), Responder::Reply(tx)), rx)
    }

    fn correlator() -> Correlator {
        Correlator::new(Duration::from_millis(500))
    }

    #[test]
    fn test_submit_on_idle_requests_dispatch() {
        let mut c = correlator();
        let (req, _rx) = request("PW?\r");
        assert!(c.submit(req));
        assert_eq!(c.dispatch_next().as_deref(), Some("PW?\r"));
        assert!(c.is_busy());
    }

    #[test]
    fn test_submit_while_busy_only_enqueues() {
        let mut c = correlator();
        let (first, _rx1) = request("PWON\r");
        let (second, _rx2) = request("MVUP\r");
        assert!(c.submit(first));
        c.dispatch_next();
        assert!(!c.submit(second));
        assert_eq!(c.queued(), 1);
    }

    #[test]
    fn test_dispatch_is_fifo() {
        let mut c = correlator();
        let mut receivers = Vec::new();
        for cmd in ["PW?\r", "SI?\r", "MUON\r"] {
            let (req, rx) = request(cmd);
            c.submit(req);
            receivers.push(rx);
        }

        let mut written = Vec::new();
        while let Some(cmd) = c.dispatch_next() {
            written.push(cmd);
            assert!(c.on_line("OK".to_string()).is_ok());
        }
        assert_eq!(written, vec!["PW?\r", "SI?\r", "MUON\r"]);
        assert!(!c.is_busy());
    }

    #[test]
    fn test_line_resolves_outstanding() {
        let mut c = correlator();
        let (req, mut rx) = request("PW?\r");
        c.submit(req);
        c.dispatch_next();
        c.arm(Instant::now());

        assert!(c.on_line("PWON".to_string()).is_ok());
        assert_eq!(rx.try_recv().unwrap().unwrap(), "PWON");
        assert!(!c.is_busy());
        assert!(c.deadline().is_none());
        assert_eq!(c.queued(), 0);
    }

    #[test]
    fn test_unsolicited_line_returned_untouched() {
        let mut c = correlator();
        let (req, mut rx) = request("PW?\r");
        c.submit(req);

        // Queued but not yet dispatched: nothing is outstanding.
        assert_eq!(c.on_line("ZMON".to_string()), Err("ZMON".to_string()));
        assert_eq!(c.queued(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deadline_not_reached() {
        let mut c = correlator();
        let (req, mut rx) = request("SI?\r");
        c.submit(req);
        c.dispatch_next();
        let now = Instant::now();
        c.arm(now);

        assert!(!c.on_deadline(now + Duration::from_millis(499)));
        assert!(c.is_busy());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deadline_times_out_with_command() {
        let mut c = correlator();
        let (req, mut rx) = request("SI?\r");
        c.submit(req);
        c.dispatch_next();
        let now = Instant::now();
        c.arm(now);

        assert_eq!(c.deadline(), Some(now + Duration::from_millis(500)));
        assert!(c.on_deadline(now + Duration::from_millis(500)));
        match rx.try_recv().unwrap() {
            Err(ProtocolError::Timeout { command, elapsed }) => {
                assert_eq!(command, "SI?");
                assert_eq!(elapsed, Duration::from_millis(500));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!c.is_busy());
    }

    #[test]
    fn test_unarmed_request_never_times_out() {
        let mut c = correlator();
        let (req, _rx) = request("SI?\r");
        c.submit(req);
        c.dispatch_next();
        assert!(!c.on_deadline(Instant::now() + Duration::from_secs(60)));
        assert!(c.is_busy());
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let mut c = correlator();
        let (req, _rx) = request("SI?\r");
        c.submit(req);
        c.dispatch_next();
        let start = Instant::now();
        c.arm(start);
        c.arm(start + Duration::from_millis(100));
        assert_eq!(c.deadline(), Some(start + Duration::from_millis(600)));
    }

    #[test]
    fn test_write_failure_resolves_outstanding() {
        let mut c = correlator();
        let (req, mut rx) = request("PWON\r");
        c.submit(req);
        c.dispatch_next();
        c.fail_outstanding(ProtocolError::WriteFailed("broken pipe".to_string()));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ProtocolError::WriteFailed(_))
        ));
        assert!(!c.is_busy());
    }

    #[test]
    fn test_close_fails_everything() {
        let mut c = correlator();
        let (first, mut rx1) = request("PW?\r");
        let (second, mut rx2) = request("SI?\r");
        c.submit(first);
        c.dispatch_next();
        c.submit(second);

        c.close();
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(!c.is_busy());
        assert_eq!(c.queued(), 0);
    }

    #[test]
    fn test_callback_invoked_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let req = Request::new(
            "MVUP\r".to_string(),
            Responder::Callback(Box::new(move |result| {
                assert_eq!(result.unwrap(), "MV50");
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let mut c = correlator();
        c.submit(req);
        c.dispatch_next();
        c.on_line("MV50".to_string()).unwrap();
        // A second line has no owner.
        assert!(c.on_line("MVMAX 80".to_string()).is_err());
        c.close();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let req = Request::new(
            "MUON\r".to_string(),
            Responder::Callback(Box::new(|_| panic!("callback failed"))),
        );
        let (next, mut rx) = request("PW?\r");

        let mut c = correlator();
        c.submit(req);
        c.submit(next);
        c.dispatch_next();
        assert!(c.on_line("MUON".to_string()).is_ok());
        assert!(!c.is_busy());

        assert_eq!(c.dispatch_next().as_deref(), Some("PW?\r"));
        c.on_line("PWON".to_string()).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), "PWON");
    }

    #[test]
    fn test_dropped_request_reports_closed() {
        let (req, mut rx) = request("PW?\r");
        drop(req);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.response_timeout, Duration::from_millis(500));
        assert_eq!(config.event_capacity, 64);
    }
}
