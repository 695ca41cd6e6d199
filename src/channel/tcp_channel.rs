//! # TCP Channel Module
//!
//! A [`RemoteChannel`] carried over plain TCP with newline-delimited JSON frames.
//!
//! ## Handshake
//!
//! ```text
//! manager                                   pod
//!   │ delegate(pod_id) -> route, key          │
//!   │ ── container env: url, route, key ────▶ │
//!   │ ◀──────────── hello{token, key} ─────── │
//!   │ link resolved: PodControl + events      │
//!   │ ── request{id, call} ─────────────────▶ │
//!   │ ◀──────────────── response{id, result}  │
//!   │ ◀──────────────── event{keep_alive}     │
//! ```
//!
//! The first frame on a connection must be a `hello` whose token names a pending
//! delegation and whose key matches the one issued with it. Anything else closes the
//! connection. Each delegation can be claimed once.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::types::{Bindings, Delegation, PodControl, PodEvent, PodLink, RemoteChannel};
use crate::error_handling::types::FleetError;
use crate::fleet_management::types::PodId;
use crate::sandbox::PodInstance;

/// How long a freshly accepted connection has to send its `hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Frame {
    Hello { token: String, key: String },
    Request { id: u64, call: Call },
    Response { id: u64, result: Result<Value, String> },
    Event { event: PodEvent },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub(crate) enum Call {
    Execute {
        code: String,
        inputs: Bindings,
        scope: Option<String>,
    },
    Stop,
}

/// Route descriptor handed to a pod in its environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub token: String,
}

struct PendingPod {
    pod_id: PodId,
    key: String,
    tx: oneshot::Sender<PodLink>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingPod>>>;

/// Manager side of the TCP channel: accepts pod connections and resolves delegations.
pub struct TcpChannel {
    url: String,
    pending: PendingMap,
    accept_task: JoinHandle<()>,
}

impl TcpChannel {
    /// Binds `listen_address` and starts accepting pods.
    ///
    /// `public_url` is the `host:port` pods are told to dial. It defaults to the bound
    /// address, which only works when pods share the host network.
    pub async fn bind(listen_address: &str, public_url: Option<String>) -> Result<Self, FleetError> {
        let listener = TcpListener::bind(listen_address).await.map_err(|e| {
            FleetError::ChannelError(format!("failed to bind {}: {}", listen_address, e))
        })?;
        let local = listener.local_addr()?;
        let url = public_url.unwrap_or_else(|| local.to_string());

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(listener, pending.clone()));

        info!("Remote channel listening on {} (advertised as {})", local, url);
        Ok(Self {
            url,
            pending,
            accept_task,
        })
    }

    /// Number of delegations still waiting for their pod.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl RemoteChannel for TcpChannel {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn delegate(&self, pod_id: PodId) -> Result<Delegation, FleetError> {
        let token = Uuid::new_v4().simple().to_string();
        let key = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| FleetError::ChannelError("pending delegations poisoned".to_string()))?;
        // Delegations whose receiver was dropped can never be claimed
        pending.retain(|_, p| !p.tx.is_closed());
        pending.insert(
            token.clone(),
            PendingPod {
                pod_id,
                key: key.clone(),
                tx,
            },
        );
        debug!("Opened delegation for pod {}", pod_id);

        let route = serde_json::to_string(&Route { token })
            .map_err(|e| FleetError::ChannelError(e.to_string()))?;
        Ok(Delegation {
            route,
            key,
            link: rx,
        })
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, pending: PendingMap) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted pod connection from {}", addr);
                let pending = pending.clone();
                tokio::spawn(async move {
                    if let Err(e) = handshake(stream, pending).await {
                        warn!("Rejected pod connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept pod connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handshake(stream: TcpStream, pending: PendingMap) -> Result<(), FleetError> {
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let first = tokio::time::timeout(HELLO_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| FleetError::ChannelError("no hello received".to_string()))??
        .ok_or_else(|| FleetError::ChannelError("closed before hello".to_string()))?;
    let (token, key) = match serde_json::from_str::<Frame>(&first) {
        Ok(Frame::Hello { token, key }) => (token, key),
        Ok(other) => {
            return Err(FleetError::ChannelError(format!(
                "expected hello, got {:?}",
                other
            )))
        }
        Err(e) => return Err(FleetError::ChannelError(format!("malformed hello: {}", e))),
    };

    let claimed = {
        let mut pending = pending
            .lock()
            .map_err(|_| FleetError::ChannelError("pending delegations poisoned".to_string()))?;
        match pending.get(&token) {
            Some(entry) if entry.key == key => pending.remove(&token),
            Some(_) => return Err(FleetError::ChannelError("key mismatch".to_string())),
            None => return Err(FleetError::ChannelError("unknown route".to_string())),
        }
    };
    let Some(claimed) = claimed else {
        return Err(FleetError::ChannelError("unknown route".to_string()));
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(Connection {
        writer: tokio::sync::Mutex::new(write),
        waiting: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        closed: AtomicBool::new(false),
    });
    let reader = tokio::spawn(read_responses(lines, connection.clone(), events_tx));
    let control = TcpPodControl {
        pod_id: claimed.pod_id,
        connection,
        reader,
    };

    info!("Pod {} connected back", claimed.pod_id);
    if claimed
        .tx
        .send(PodLink {
            control: Arc::new(control),
            events: events_rx,
        })
        .is_err()
    {
        warn!("Pod {} connected after its delegation was abandoned", claimed.pod_id);
    }
    Ok(())
}

async fn write_frame(
    writer: &tokio::sync::Mutex<OwnedWriteHalf>,
    frame: &Frame,
) -> Result<(), FleetError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| FleetError::ChannelError(e.to_string()))?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

type Responder = oneshot::Sender<Result<Value, String>>;

struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    waiting: Mutex<HashMap<u64, Responder>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    fn forget(&self, id: u64) {
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.remove(&id);
        }
    }
}

async fn read_responses(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    connection: Arc<Connection>,
    events: mpsc::UnboundedSender<PodEvent>,
) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Pod link read error: {}", e);
                break;
            }
        };
        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Response { id, result }) => {
                let responder = connection.waiting.lock().ok().and_then(|mut w| w.remove(&id));
                match responder {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("Dropping response to unknown request {}", id),
                }
            }
            Ok(Frame::Event { event }) => {
                let _ = events.send(event);
            }
            Ok(other) => warn!("Unexpected frame from pod: {:?}", other),
            Err(e) => warn!("Malformed frame from pod: {}", e),
        }
    }

    // Set before clearing so a concurrent `call` either sees the flag or loses its responder
    connection.closed.store(true, Ordering::SeqCst);
    if let Ok(mut waiting) = connection.waiting.lock() {
        waiting.clear();
    }
    debug!("Pod link closed");
}

/// Manager-side [`PodControl`] over an accepted pod connection.
pub struct TcpPodControl {
    pod_id: PodId,
    connection: Arc<Connection>,
    reader: JoinHandle<()>,
}

impl TcpPodControl {
    async fn call(&self, call: Call) -> Result<Value, FleetError> {
        let closed = || FleetError::ChannelError(format!("link to pod {} is closed", self.pod_id));
        if self.connection.closed.load(Ordering::SeqCst) {
            return Err(closed());
        }

        let id = self.connection.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.connection
            .waiting
            .lock()
            .map_err(|_| FleetError::ChannelError("pending requests poisoned".to_string()))?
            .insert(id, tx);
        if self.connection.closed.load(Ordering::SeqCst) {
            self.connection.forget(id);
            return Err(closed());
        }

        if let Err(e) = write_frame(&self.connection.writer, &Frame::Request { id, call }).await {
            self.connection.forget(id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(FleetError::ChannelError(message)),
            Err(_) => Err(closed()),
        }
    }
}

#[async_trait]
impl PodControl for TcpPodControl {
    async fn execute(
        &self,
        code: &str,
        inputs: Bindings,
        scope: Option<&str>,
    ) -> Result<Bindings, FleetError> {
        let value = self
            .call(Call::Execute {
                code: code.to_string(),
                inputs,
                scope: scope.map(str::to_string),
            })
            .await?;
        match value {
            Value::Object(bindings) => Ok(bindings),
            other => Err(FleetError::ChannelError(format!(
                "execute returned {} instead of bindings",
                other
            ))),
        }
    }

    async fn stop(&self) -> Result<(), FleetError> {
        self.call(Call::Stop).await.map(|_| ())
    }
}

impl Drop for TcpPodControl {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Pod side of the TCP channel: serves a [`PodInstance`] to the manager.
pub struct PodEndpoint {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    instance: Arc<PodInstance>,
    serve: JoinHandle<()>,
}

/// Connects a pod back to the manager using the values from its environment.
///
/// `url` is `host:port`, optionally prefixed with `tcp://`.
pub async fn connect_pod(
    url: &str,
    route: &str,
    key: &str,
    instance: Arc<PodInstance>,
) -> Result<PodEndpoint, FleetError> {
    let route: Route = serde_json::from_str(route)
        .map_err(|e| FleetError::ChannelError(format!("malformed route: {}", e)))?;
    let address = url.strip_prefix("tcp://").unwrap_or(url);
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| FleetError::ChannelError(format!("failed to reach {}: {}", url, e)))?;
    let (read, write) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write));

    write_frame(
        &writer,
        &Frame::Hello {
            token: route.token,
            key: key.to_string(),
        },
    )
    .await?;

    let serve = tokio::spawn(serve_requests(
        BufReader::new(read).lines(),
        writer.clone(),
        instance.clone(),
    ));
    info!("Connected to fleet manager at {}", url);
    Ok(PodEndpoint {
        writer,
        instance,
        serve,
    })
}

impl PodEndpoint {
    /// Tells the manager the pod is in use.
    pub async fn keep_alive(&self) -> Result<(), FleetError> {
        write_frame(
            &self.writer,
            &Frame::Event {
                event: PodEvent::KeepAlive,
            },
        )
        .await
    }

    /// Serves requests until the instance is stopped or the manager hangs up.
    pub async fn run_until_stopped(mut self) {
        tokio::select! {
            _ = self.instance.stopped() => {
                let stopping = Frame::Event { event: PodEvent::Stopping };
                if let Err(e) = write_frame(&self.writer, &stopping).await {
                    debug!("Could not announce stop: {}", e);
                }
                self.serve.abort();
            }
            _ = &mut self.serve => {
                debug!("Manager link closed");
            }
        }
    }
}

async fn serve_requests(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    instance: Arc<PodInstance>,
) {
    while let Ok(Some(line)) = lines.next_line().await {
        let (id, call) = match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Request { id, call }) => (id, call),
            Ok(other) => {
                warn!("Unexpected frame from manager: {:?}", other);
                continue;
            }
            Err(e) => {
                warn!("Malformed frame from manager: {}", e);
                continue;
            }
        };

        let writer = writer.clone();
        let instance = instance.clone();
        tokio::spawn(async move {
            let result = match call {
                Call::Execute {
                    code,
                    inputs,
                    scope,
                } => instance
                    .execute(&code, inputs, scope.as_deref())
                    .await
                    .map(Value::Object),
                Call::Stop => {
                    instance.stop();
                    Ok(Value::Null)
                }
            };
            if let Err(e) = write_frame(&writer, &Frame::Response { id, result }).await {
                warn!("Failed to answer request {}: {}", id, e);
            }
        });
    }
}
