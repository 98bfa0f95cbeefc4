//! Multi-server coordination with quorum-verified results.
//!
//! A [`Cluster`] manages a pool of [`Client`]s and answers each logical
//! request by fanning it out to `distribution` servers and accepting the
//! first value that `confidence` of them agree on. Agreement is byte
//! identity of a canonical (stable key order) JSON rendering, so a lying or
//! corrupted minority cannot steer the result. The same quorum rule applies
//! to server-pushed notifications.
//!
//! Readiness is a two-state machine: the cluster is READY while at least
//! `distribution` members hold live connections and DEGRADED otherwise,
//! transitioning only on per-server connect/close edges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{lock, Client, ClientConfig, ConnectionState, NotificationHandler, Response};
use crate::diag;
use crate::error::{Error, Result};
use crate::protocol::VERSION_REGEX;

/// Cadence of the [`ready`](Cluster::ready) status poll.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Peer selection order for request fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Pick uniformly among the remaining candidates
    #[default]
    Random,
    /// Pick the first remaining candidate in insertion order
    Priority,
}

/// Aggregate connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Fewer live connections than `distribution`; requests are refused
    Degraded,
    /// Enough live connections to satisfy the fan-out
    Ready,
}

/// Cluster configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Application identity sent during each member's handshake
    pub application: String,

    /// Protocol version to negotiate with every member
    pub version: String,

    /// Matching canonical results required to accept a value
    pub confidence: usize,

    /// Servers each request is fanned out to. Zero means no fan-out was
    /// requested; the operational minimum of one server still applies.
    pub distribution: usize,

    /// Peer selection order
    pub order: Order,

    /// Per-member keep-alive interval; zero disables
    pub keep_alive: Duration,

    /// Accepted for interface compatibility; reconnection is not performed
    pub retry: Duration,

    /// Per-member connect budget, and the [`ready`](Cluster::ready) wait budget
    pub timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            application: "amberline/0.1.0".to_string(),
            version: "1.4.2".to_string(),
            confidence: 1,
            distribution: 0,
            order: Order::Random,
            keep_alive: Duration::from_secs(300),
            retry: Duration::from_secs(900),
            timeout: Duration::from_secs(10),
        }
    }
}

struct ServerSlot {
    key: String,
    client: Arc<Client>,
    up: Arc<AtomicBool>,
}

struct ClusterShared {
    /// Members in insertion order; PRIORITY selection depends on it
    registry: Mutex<Vec<ServerSlot>>,
    live: AtomicUsize,
    /// Effective fan-out: `max(1, configured distribution)`
    distribution: usize,
    /// Set once by shutdown; pins the status at DEGRADED
    shut: AtomicBool,
    status_tx: watch::Sender<ClusterStatus>,
}

impl ClusterShared {
    /// Recompute status from the live count. Called on every edge.
    fn reevaluate(&self) {
        let live = self.live.load(Ordering::SeqCst);
        let next = if !self.shut.load(Ordering::SeqCst) && live >= self.distribution {
            ClusterStatus::Ready
        } else {
            ClusterStatus::Degraded
        };
        self.status_tx.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            info!(target: diag::STATUS, from = ?*status, to = ?next, live, "cluster status");
            *status = next;
            true
        });
    }
}

/// Electrum client pool with quorum-style result agreement.
pub struct Cluster {
    config: ClusterConfig,
    shared: Arc<ClusterShared>,
    status_rx: watch::Receiver<ClusterStatus>,
}

impl Cluster {
    /// Create an empty cluster.
    ///
    /// Fails when the version string is invalid or the strategy is
    /// unsatisfiable: confidence must be at least one and can never exceed
    /// the effective distribution, otherwise no request could ever succeed.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        if !VERSION_REGEX.is_match(&config.version) {
            return Err(Error::InvalidVersion(config.version.clone()));
        }
        let distribution = config.distribution.max(1);
        if config.confidence < 1 {
            return Err(Error::InvalidStrategy(
                "confidence must be at least 1".to_string(),
            ));
        }
        if config.confidence > distribution {
            return Err(Error::InvalidStrategy(format!(
                "confidence {} exceeds distribution {}",
                config.confidence, distribution
            )));
        }

        let (status_tx, status_rx) = watch::channel(ClusterStatus::Degraded);
        Ok(Self {
            config,
            shared: Arc::new(ClusterShared {
                registry: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                distribution,
                shut: AtomicBool::new(false),
                status_tx,
            }),
            status_rx,
        })
    }

    /// Current aggregate status.
    pub fn status(&self) -> ClusterStatus {
        *self.status_rx.borrow()
    }

    /// Whether the cluster can currently satisfy requests.
    pub fn is_ready(&self) -> bool {
        self.status() == ClusterStatus::Ready
    }

    /// Register a server and connect to it.
    ///
    /// The member starts DOWN; a monitor on its connection-state watch
    /// drives the live count and the cluster status on every edge. A failed
    /// connect leaves the member registered (and DOWN).
    pub async fn add_server(&self, host: &str, port: u16) -> Result<bool> {
        let client = Arc::new(Client::new(self.client_config(host, port))?);
        self.register(host, port, client.clone())?;
        client.connect().await
    }

    /// Register a server whose client connects over a pre-established
    /// transport. Test seam mirroring [`add_server`](Cluster::add_server).
    #[cfg(test)]
    pub(crate) async fn add_server_with(
        &self,
        host: &str,
        port: u16,
        transport: Box<dyn crate::connection::Transport>,
    ) -> Result<bool> {
        let client = Arc::new(Client::new(self.client_config(host, port))?);
        self.register(host, port, client.clone())?;
        client.connect_with(transport).await
    }

    fn client_config(&self, host: &str, port: u16) -> ClientConfig {
        ClientConfig {
            application: self.config.application.clone(),
            version: self.config.version.clone(),
            host: host.to_string(),
            port,
            keep_alive: self.config.keep_alive,
            retry: self.config.retry,
            timeout: self.config.timeout,
        }
    }

    fn register(&self, host: &str, port: u16, client: Arc<Client>) -> Result<()> {
        let key = format!("{host}:{port}");
        let up = Arc::new(AtomicBool::new(false));
        {
            let mut registry = lock(&self.shared.registry);
            if registry.iter().any(|slot| slot.key == key) {
                return Err(Error::DuplicateServer(key));
            }
            registry.push(ServerSlot {
                key: key.clone(),
                client: client.clone(),
                up: up.clone(),
            });
        }
        debug!(target: diag::ACTION, server = %key, "server registered");

        let shared = self.shared.clone();
        let mut state = client.state();
        tokio::spawn(async move {
            let mut was_up = false;
            loop {
                let connected = *state.borrow_and_update() == ConnectionState::Connected;
                if connected != was_up {
                    was_up = connected;
                    up.store(connected, Ordering::SeqCst);
                    if connected {
                        shared.live.fetch_add(1, Ordering::SeqCst);
                        info!(target: diag::STATUS, server = %key, "server up");
                    } else {
                        shared.live.fetch_sub(1, Ordering::SeqCst);
                        info!(target: diag::STATUS, server = %key, "server down");
                    }
                    shared.reevaluate();
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
            if was_up {
                up.store(false, Ordering::SeqCst);
                shared.live.fetch_sub(1, Ordering::SeqCst);
                shared.reevaluate();
            }
        });
        Ok(())
    }

    /// Wait for the cluster to become READY.
    ///
    /// Polls every 50 ms; resolves `false` once the configured timeout
    /// elapses without readiness.
    pub async fn ready(&self) -> bool {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            if self.is_ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Issue one logical request to `distribution` servers and return the
    /// first value `confidence` of them agree on.
    ///
    /// Fails synchronously with [`Error::NotReady`] when degraded.
    /// Aggregation is event-driven: each peer settlement updates a tally of
    /// canonical renderings, and the request resolves the moment any value
    /// reaches the confidence threshold. Peers that fail in transport settle
    /// without matching any tally. When every queried peer has settled with
    /// no winner, the request fails with
    /// [`Error::InsufficientIntegrity`].
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Response> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        let chosen = {
            let registry = lock(&self.shared.registry);
            let snapshot: Vec<PeerSnapshot> = registry
                .iter()
                .map(|slot| PeerSnapshot {
                    key: slot.key.clone(),
                    client: slot.client.clone(),
                    up: slot.up.load(Ordering::SeqCst),
                })
                .collect();
            select_peers(snapshot, self.shared.distribution, self.config.order)
        };
        let queried = chosen.len();
        debug!(target: diag::ACTION, %method, fan_out = queried, "cluster request");

        let mut inflight = JoinSet::new();
        for (key, client) in chosen {
            let method = method.to_string();
            let params = params.clone();
            inflight.spawn(async move { (key, client.request(&method, params).await) });
        }

        let confidence = self.config.confidence;
        let mut tallies: HashMap<String, usize> = HashMap::new();
        while let Some(joined) = inflight.join_next().await {
            let Ok((key, outcome)) = joined else { continue };
            match outcome {
                Ok(response) => {
                    let canonical = canonical_key(&response)?;
                    let count = tallies.entry(canonical).or_insert(0);
                    *count += 1;
                    if *count >= confidence {
                        debug!(target: diag::EVENTS, server = %key, agreeing = *count, "quorum reached");
                        return Ok(response);
                    }
                }
                Err(error) => {
                    warn!(target: diag::ERRORS, server = %key, %error, "peer request failed");
                }
            }
        }

        warn!(target: diag::ERRORS, %method, confidence, queried, "insufficient integrity");
        Err(Error::InsufficientIntegrity { confidence, queried })
    }

    /// Subscribe to a method's notifications across the whole pool.
    ///
    /// An aggregating interceptor goes on every member's notification bus:
    /// each arriving payload is canonicalized and tallied, and the
    /// application callback fires exactly when a distinct value's tally
    /// reaches the confidence threshold, at most once per value. Values
    /// that never reach it are suppressed. The initial state is obtained
    /// through a quorum request and delivered to the callback once.
    pub async fn subscribe(
        &self,
        callback: NotificationHandler,
        method: &str,
        params: Vec<Value>,
    ) -> Result<bool> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        let confidence = self.config.confidence;
        let interceptor: NotificationHandler = {
            let callback = callback.clone();
            let tallies: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
            Arc::new(move |payload: Value| {
                let Ok(canonical) = canonical_json(&payload) else {
                    return;
                };
                let fire = {
                    let mut tallies = lock(&tallies);
                    let count = tallies.entry(canonical).or_insert(0);
                    *count += 1;
                    *count == confidence
                };
                if fire {
                    callback(payload);
                }
            })
        };

        let members: Vec<Arc<Client>> = lock(&self.shared.registry)
            .iter()
            .map(|slot| slot.client.clone())
            .collect();
        for member in members {
            member.add_handler(method, interceptor.clone());
        }
        debug!(target: diag::ACTION, %method, "cluster subscription installed");

        let initial = self.request(method, params).await?;
        match initial {
            Response::Result(value) => callback(value),
            Response::Error(error) => callback(serde_json::to_value(error)?),
        }
        Ok(true)
    }

    /// Tear the whole pool down.
    ///
    /// The status drops to DEGRADED permanently, every member is
    /// force-disconnected in parallel, and all settlements are returned.
    /// In-flight requests are not awaited; they settle with transport
    /// errors.
    pub async fn shutdown(&self) -> Vec<Result<bool>> {
        info!(target: diag::ACTION, "cluster shutdown");
        self.shared.shut.store(true, Ordering::SeqCst);
        self.shared.reevaluate();

        let members: Vec<Arc<Client>> = lock(&self.shared.registry)
            .iter()
            .map(|slot| slot.client.clone())
            .collect();
        let mut teardowns = JoinSet::new();
        for member in members {
            teardowns.spawn(async move { member.disconnect(true).await });
        }

        let mut settled = Vec::new();
        while let Some(joined) = teardowns.join_next().await {
            settled.push(joined.unwrap_or(Err(Error::ManuallyDisconnected)));
        }
        settled
    }

    #[cfg(test)]
    pub(crate) fn peers_up(&self) -> Vec<(String, bool)> {
        lock(&self.shared.registry)
            .iter()
            .map(|slot| (slot.key.clone(), slot.up.load(Ordering::SeqCst)))
            .collect()
    }
}

struct PeerSnapshot {
    key: String,
    client: Arc<Client>,
    up: bool,
}

/// Select `distribution` UP peers from the snapshot without replacement.
///
/// DOWN peers are consumed from the snapshot without counting toward the
/// fan-out. Selection stops early when the snapshot runs dry.
fn select_peers(
    mut snapshot: Vec<PeerSnapshot>,
    distribution: usize,
    order: Order,
) -> Vec<(String, Arc<Client>)> {
    use rand::Rng;

    let mut rng = rand::rng();
    let mut chosen = Vec::new();
    while chosen.len() < distribution && !snapshot.is_empty() {
        let index = match order {
            Order::Priority => 0,
            Order::Random => rng.random_range(0..snapshot.len()),
        };
        let peer = snapshot.remove(index);
        if peer.up {
            chosen.push((peer.key, peer.client));
        }
    }
    chosen
}

/// Tally key for a settled peer response. Results and server errors live in
/// disjoint key spaces so they can never corroborate each other.
fn canonical_key(response: &Response) -> Result<String> {
    Ok(match response {
        Response::Result(value) => format!("result:{}", canonical_json(value)?),
        Response::Error(error) => {
            format!("error:{}", canonical_json(&serde_json::to_value(error)?)?)
        }
    })
}

/// Stable serialization for quorum comparison: object keys in sorted order
/// at every depth. Two values agree iff these strings are byte-identical;
/// numerically equal but textually different values deliberately disagree.
pub(crate) fn canonical_json(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Array(items) => {
            let parts = items
                .iter()
                .map(canonical_json)
                .collect::<Result<Vec<_>>>()?;
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by_key(|(key, _)| *key);
            let mut parts = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                parts.push(format!(
                    "{}:{}",
                    serde_json::to_string(key)?,
                    canonical_json(value)?
                ));
            }
            format!("{{{}}}", parts.join(","))
        }
        scalar => serde_json::to_string(scalar)?,
    })
}
