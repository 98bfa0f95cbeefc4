//! Single-server Electrum client.
//!
//! A [`Client`] owns one connection to one server. `connect` dials TLS and
//! performs the version negotiation handshake; after that an I/O task (the
//! statement router) exclusively owns the socket, the pending-request
//! table, and the notification bus. The application-facing methods talk to
//! the router over channels, so any number of requests can be outstanding
//! concurrently and responses are correlated by id regardless of arrival
//! order.
//!
//! Server-reported errors are part of normal operation on this protocol:
//! `request` resolves with [`Response::Error`] rather than failing, so the
//! caller can distinguish a peer that answered "no" from a connection that
//! died.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::diag;
use crate::error::{Error, Result};
use crate::protocol::{
    self, Inbound, RequestId, RpcError, Statement, KEEP_ALIVE_ID, VERSION_NEGOTIATION_ID,
    VERSION_REGEX,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application identity sent during version negotiation
    pub application: String,

    /// Protocol version to negotiate (digits separated by dots)
    pub version: String,

    /// Server hostname
    pub host: String,

    /// Server TLS port
    pub port: u16,

    /// Idle interval after which a keep-alive ping is sent; zero disables.
    /// `server.ping` is only safe at protocol 1.2 and later.
    pub keep_alive: Duration,

    /// Accepted for interface compatibility; reconnection is not performed
    pub retry: Duration,

    /// Initial-connect budget, covering TCP, TLS, and the handshake
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            application: "amberline/0.1.0".to_string(),
            version: "1.4.2".to_string(),
            host: String::new(),
            port: 50002,
            keep_alive: Duration::from_secs(300),
            retry: Duration::from_secs(900),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a round-trip that the server answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The `result` field of the response
    Result(Value),
    /// The server reported an error for this request
    Error(RpcError),
}

impl Response {
    /// Convert to a standard `Result`, turning a server error into `Err`.
    pub fn into_result(self) -> std::result::Result<Value, RpcError> {
        match self {
            Response::Result(value) => Ok(value),
            Response::Error(error) => Err(error),
        }
    }
}

/// Callback invoked with the `params` of each matching notification.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Whether the client currently holds a negotiated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, or the connection has been torn down
    Disconnected,
    /// Transport up and version negotiated
    Connected,
}

type SubscriberMap = HashMap<String, Vec<NotificationHandler>>;
type Completer = oneshot::Sender<Result<Response>>;

/// Poison-recovering lock. The maps behind these mutexes stay consistent
/// across a panicking handler, so the poison flag carries no information.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Command {
    Request {
        method: String,
        params: Vec<Value>,
        reply: Completer,
    },
}

struct Link {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Electrum client for a single server.
pub struct Client {
    config: ClientConfig,
    bus: Arc<Mutex<SubscriberMap>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    link: Mutex<Option<Link>>,
}

impl Client {
    /// Create a client. Fails when `version` is not a dotted version string;
    /// no I/O happens until [`connect`](Client::connect).
    pub fn new(config: ClientConfig) -> Result<Self> {
        if !VERSION_REGEX.is_match(&config.version) {
            return Err(Error::InvalidVersion(config.version.clone()));
        }
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            config,
            bus: Arc::new(Mutex::new(HashMap::new())),
            state_tx: Arc::new(state_tx),
            state_rx,
            link: Mutex::new(None),
        })
    }

    /// Whether a negotiated connection is currently up.
    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    /// Watch connection-state edges. Used by the cluster to track per-server
    /// up/down transitions.
    pub(crate) fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Connect and negotiate the protocol version.
    ///
    /// Idempotent: resolves immediately when already connected. Sends
    /// `server.version` with `[application, version]` under the negotiation
    /// sentinel id and accepts only a byte-identical version echo; any
    /// server error or version skew tears the transport down and fails.
    pub async fn connect(&self) -> Result<bool> {
        if self.is_connected() {
            return Ok(true);
        }
        let conn = Connection::open(
            &self.config.host,
            self.config.port,
            self.config.keep_alive,
            self.config.timeout,
        )
        .await?;
        self.establish(conn).await
    }

    /// Connect over a pre-established transport. Test seam mirroring the
    /// production path from the handshake onward.
    #[cfg(test)]
    pub(crate) async fn connect_with(
        &self,
        transport: Box<dyn crate::connection::Transport>,
    ) -> Result<bool> {
        if self.is_connected() {
            return Ok(true);
        }
        let conn = Connection::new(transport, self.config.keep_alive);
        self.establish(conn).await
    }

    async fn establish(&self, mut conn: Connection) -> Result<bool> {
        match tokio::time::timeout(self.config.timeout, negotiate(&mut conn, &self.config)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(target: diag::ERRORS, host = %self.config.host, %error, "handshake failed");
                return Err(error);
            }
            Err(_) => return Err(Error::Timeout),
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let router = Router {
            pending: HashMap::new(),
            bus: self.bus.clone(),
            next_id: 0,
            state: self.state_tx.clone(),
        };
        let _ = self.state_tx.send(ConnectionState::Connected);
        let task = tokio::spawn(router.run(conn, cmd_rx, shutdown.clone()));
        *lock(&self.link) = Some(Link {
            commands: cmd_tx,
            shutdown,
            task,
        });
        Ok(true)
    }

    /// Issue a request and await the correlated response.
    ///
    /// Fails synchronously with [`Error::NotConnected`] when no connection
    /// is up. A server-side error arrives as `Ok(Response::Error(…))`; an
    /// `Err` means the answer never came (transport loss or teardown).
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Response> {
        let commands = self.commands()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply: reply_tx,
            })
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Subscribe to a method's notifications.
    ///
    /// Registers the callback, issues the initial request, and delivers the
    /// initial result to the callback exactly once. On Electrum the
    /// starting state comes back as the response to the subscribe call, not
    /// as a notification.
    pub async fn subscribe(
        &self,
        callback: NotificationHandler,
        method: &str,
        params: Vec<Value>,
    ) -> Result<bool> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.add_handler(method, callback.clone());
        let initial = self.request(method, params).await?;
        match initial {
            Response::Result(value) => callback(value),
            Response::Error(error) => callback(serde_json::to_value(error)?),
        }
        Ok(true)
    }

    /// Register a notification handler without issuing a request. The
    /// cluster uses this to install aggregating interceptors on every
    /// member, connected or not.
    pub(crate) fn add_handler(&self, method: &str, handler: NotificationHandler) {
        lock(&self.bus)
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    /// Tear the connection down.
    ///
    /// Every pending request settles with [`Error::ManuallyDisconnected`]
    /// and all subscribers are dropped before the socket closes. Resolves
    /// `true` when a connection was actually torn down, `false` when there
    /// was nothing to do (unless `force`).
    pub async fn disconnect(&self, force: bool) -> Result<bool> {
        if !self.is_connected() && !force {
            return Ok(false);
        }
        let link = lock(&self.link).take();
        let Some(link) = link else {
            return Ok(false);
        };
        debug!(target: diag::ACTION, host = %self.config.host, "disconnecting");
        link.shutdown.cancel();
        let _ = link.task.await;
        Ok(true)
    }

    fn commands(&self) -> Result<mpsc::UnboundedSender<Command>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        lock(&self.link)
            .as_ref()
            .map(|link| link.commands.clone())
            .ok_or(Error::NotConnected)
    }
}

/// Send `server.version` and check the echo.
async fn negotiate(conn: &mut Connection, config: &ClientConfig) -> Result<()> {
    let params = [
        Value::String(config.application.clone()),
        Value::String(config.version.clone()),
    ];
    let frame = protocol::build_request(
        "server.version",
        &params,
        RequestId::name(VERSION_NEGOTIATION_ID),
    )?;
    conn.send(&frame).await?;

    let text = conn
        .next_statement()
        .await?
        .ok_or(Error::Disconnected)?;
    let statement = match protocol::parse_statement(&text)? {
        Inbound::Single(statement) => statement,
        Inbound::Batch(_) => {
            return Err(Error::Handshake(
                "batch response during version negotiation".to_string(),
            ))
        }
    };

    if let Some(error) = statement.error {
        return Err(Error::Handshake(error.message));
    }
    let result = statement.result.ok_or_else(|| {
        Error::Handshake("version negotiation response carried no result".to_string())
    })?;
    let negotiated = result
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Handshake("malformed server.version result".to_string()))?;
    if negotiated != config.version {
        return Err(Error::IncompatibleVersion {
            requested: config.version.clone(),
            negotiated: negotiated.to_string(),
        });
    }

    let server = result.get(0).and_then(Value::as_str).unwrap_or("unknown");
    debug!(target: diag::EVENTS, server, version = negotiated, "version negotiated");
    Ok(())
}

#[derive(Clone, Copy)]
enum Teardown {
    Manual,
    Transport,
}

/// The steady-state statement router.
///
/// Owns the pending-request table and drives the connection: statements in,
/// frames out, keep-alive pings when idle. Exits on transport loss, on
/// cancellation, or when the client handle goes away; on exit every pending
/// request settles with the teardown error and the bus is drained.
struct Router {
    pending: HashMap<u64, Completer>,
    bus: Arc<Mutex<SubscriberMap>>,
    next_id: u64,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Router {
    async fn run(
        mut self,
        mut conn: Connection,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        let reason = loop {
            let idle_deadline = conn.idle_deadline();
            tokio::select! {
                statement = conn.next_statement() => match statement {
                    Ok(Some(text)) => {
                        if let Err(error) = self.route(&text) {
                            warn!(target: diag::ERRORS, %error, "failed to route statement");
                        }
                    }
                    Ok(None) => {
                        debug!(target: diag::EVENTS, "connection closed by server");
                        break Teardown::Transport;
                    }
                    Err(error) => {
                        warn!(target: diag::ERRORS, %error, "transport error");
                        break Teardown::Transport;
                    }
                },

                command = commands.recv() => match command {
                    Some(Command::Request { method, params, reply }) => {
                        self.send_request(&mut conn, method, params, reply).await;
                    }
                    // Client handle dropped: treat as a manual teardown.
                    None => break Teardown::Manual,
                },

                _ = idle_wait(idle_deadline) => {
                    if let Err(error) = conn.ping().await {
                        warn!(target: diag::ERRORS, %error, "keep-alive ping failed");
                        break Teardown::Transport;
                    }
                }

                _ = shutdown.cancelled() => {
                    debug!(target: diag::ACTION, "manual disconnection");
                    break Teardown::Manual;
                }
            }
        };

        let teardown_error = || match reason {
            Teardown::Manual => Error::ManuallyDisconnected,
            Teardown::Transport => Error::Disconnected,
        };
        for (_, completer) in self.pending.drain() {
            let _ = completer.send(Err(teardown_error()));
        }
        // Requests queued behind the teardown settle the same way.
        while let Ok(Command::Request { reply, .. }) = commands.try_recv() {
            let _ = reply.send(Err(teardown_error()));
        }
        lock(&self.bus).clear();
        let _ = self.state.send(ConnectionState::Disconnected);
    }

    /// Allocate the next id, register the completer, write the frame.
    async fn send_request(
        &mut self,
        conn: &mut Connection,
        method: String,
        params: Vec<Value>,
        reply: Completer,
    ) {
        self.next_id += 1;
        let id = self.next_id;

        let frame = match protocol::build_request(&method, &params, RequestId::Number(id)) {
            Ok(frame) => frame,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };

        debug!(target: diag::ACTION, %method, id, "request");
        self.pending.insert(id, reply);
        if let Err(error) = conn.send(&frame).await {
            // The read side will notice the dead socket and tear down; this
            // request can already be settled.
            if let Some(completer) = self.pending.remove(&id) {
                let _ = completer.send(Err(error));
            }
        }
    }

    fn route(&mut self, text: &str) -> Result<()> {
        match protocol::parse_statement(text)? {
            Inbound::Batch(statements) => {
                for statement in statements {
                    self.dispatch(statement);
                }
            }
            Inbound::Single(statement) => self.dispatch(statement),
        }
        Ok(())
    }

    fn dispatch(&mut self, statement: Statement) {
        match statement.id {
            Some(RequestId::Name(ref name)) if name.as_str() == KEEP_ALIVE_ID => {
                debug!(target: diag::EVENTS, "keep-alive acknowledged");
            }
            Some(RequestId::Name(name)) => {
                warn!(target: diag::ERRORS, id = %name, "response with unexpected sentinel id");
            }
            Some(RequestId::Number(id)) => {
                let Some(completer) = self.pending.remove(&id) else {
                    error!(target: diag::ERRORS, id, "response for unknown request id");
                    debug_assert!(false, "response for unknown request id {id}");
                    return;
                };
                let outcome = match statement.error {
                    Some(error) => Response::Error(error),
                    None => Response::Result(statement.result.unwrap_or(Value::Null)),
                };
                let _ = completer.send(Ok(outcome));
            }
            None => {
                let Some(method) = statement.method else {
                    warn!(target: diag::ERRORS, "statement with neither id nor method");
                    return;
                };
                let params = statement.params.unwrap_or(Value::Null);
                debug!(target: diag::EVENTS, %method, "notification");
                let handlers: Vec<NotificationHandler> = lock(&self.bus)
                    .get(&method)
                    .map(|subscribers| subscribers.to_vec())
                    .unwrap_or_default();
                for handler in handlers {
                    handler(params.clone());
                }
            }
        }
    }
}

async fn idle_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
