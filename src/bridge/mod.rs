//! Platform Bridge (§4.I) — a single-host RPC endpoint bound to a fixed
//! TCP port, reachable from containers via `host.docker.internal`.
//!
//! Requests are length-prefixed JSON frames: a 4-byte big-endian length
//! followed by that many bytes of `{"id", "verb", "params"}`. One
//! connection handler task per socket parses frames and posts each onto
//! the bridge's event loop, then blocks on the result with the
//! configured RPC ceiling — generalizing the teacher's pattern of
//! keeping a single owner for shared mutable state and having callers
//! communicate with it over a channel rather than taking locks directly.

mod dispatch;

use crate::chat_history::ChatHistoryStore;
use crate::composer::ProfileComposer;
use crate::config::BridgeConfig;
use crate::doc_store::ProfileDocumentStore;
use crate::error::{CoreError, Result};
use crate::image_cache::ImageCache;
use crate::llm::GatewayClient;
use crate::module::ModuleRegistry;
use crate::provides::ProvidesGraph;
use crate::warm_pool::WarmContainerPool;
use crate::workspace_store::WorkspaceStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Every store and service a bridge verb might need. Held behind one
/// `Arc` and cloned into each spawned dispatch task.
pub struct BridgeComponents {
    pub modules: Arc<ModuleRegistry>,
    pub provides: Arc<ProvidesGraph>,
    pub workspace_store: Arc<WorkspaceStore>,
    pub chat_history: Arc<ChatHistoryStore>,
    pub doc_store: Arc<ProfileDocumentStore>,
    pub warm_pool: Arc<WarmContainerPool>,
    pub image_cache: Arc<ImageCache>,
    pub gateway: Arc<GatewayClient>,
}

impl BridgeComponents {
    pub fn composer(&self) -> ProfileComposer<'_> {
        ProfileComposer::new(&self.modules, &self.provides)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    id: String,
    verb: String,
    #[serde(default)]
    params: Value,
}

struct PostedRequest {
    envelope: Envelope,
    respond_to: oneshot::Sender<Value>,
}

/// Static catalog for `get_supported_content_types` — the presentation
/// layer's renderable MIME types (§4.I). Not an open-ended registry:
/// extending it means shipping a new build.
pub const SUPPORTED_CONTENT_TYPES: &[&str] = &["text/plain", "text/markdown", "application/json", "image/png"];

pub struct BridgeServer {
    components: Arc<BridgeComponents>,
    config: BridgeConfig,
    queue: mpsc::Sender<PostedRequest>,
}

impl BridgeServer {
    pub fn new(components: Arc<BridgeComponents>, config: BridgeConfig) -> Arc<Self> {
        let queue = spawn_event_loop(Arc::clone(&components));
        Arc::new(Self { components, config, queue })
    }

    /// Binds `(bind_addr, port)` and serves forever. Each accepted
    /// connection gets its own handler task; the bridge itself never
    /// blocks on a single slow client.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| CoreError::PlatformCallFailed { message: format!("bridge bind {addr} failed: {e}") })?;
        info!(%addr, "platform bridge listening");

        loop {
            let (socket, peer) = listener
                .accept()
                .await
                .map_err(|e| CoreError::PlatformCallFailed { message: format!("bridge accept failed: {e}") })?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(socket).await {
                    warn!(%peer, error = %e, "bridge connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) -> Result<()> {
        let timeout = Duration::from_secs(self.config.rpc_timeout_secs);
        loop {
            let mut len_buf = [0u8; 4];
            match socket.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => {
                    return Err(CoreError::PlatformCallFailed { message: format!("bridge read failed: {e}") })
                }
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            socket
                .read_exact(&mut body)
                .await
                .map_err(|e| CoreError::PlatformCallFailed { message: format!("bridge read failed: {e}") })?;

            let response = match serde_json::from_slice::<Envelope>(&body) {
                Ok(envelope) => self.post_and_wait(envelope, timeout).await,
                Err(e) => {
                    serde_json::json!({"id": Value::Null, "ok": false, "error": format!("malformed request: {e}")})
                }
            };

            let payload = serde_json::to_vec(&response)
                .map_err(|e| CoreError::PlatformCallFailed { message: format!("encoding bridge response: {e}") })?;
            socket
                .write_all(&(payload.len() as u32).to_be_bytes())
                .await
                .map_err(|e| CoreError::PlatformCallFailed { message: format!("bridge write failed: {e}") })?;
            socket
                .write_all(&payload)
                .await
                .map_err(|e| CoreError::PlatformCallFailed { message: format!("bridge write failed: {e}") })?;
        }
    }

    /// Posts `envelope` to the bridge's event loop and blocks this RPC
    /// worker on the result, enforcing the 300 s (configurable) ceiling
    /// from §5.
    async fn post_and_wait(&self, envelope: Envelope, timeout: Duration) -> Value {
        let id = envelope.id.clone();
        let (respond_to, rx) = oneshot::channel();
        if self.queue.send(PostedRequest { envelope, respond_to }).await.is_err() {
            return serde_json::json!({"id": id, "ok": false, "error": "bridge event loop unavailable"});
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => serde_json::json!({"id": id, "ok": false, "error": "bridge event loop dropped the request"}),
            Err(_) => serde_json::json!({"id": id, "ok": false, "error": "bridge RPC timed out"}),
        }
    }
}

fn spawn_event_loop(components: Arc<BridgeComponents>) -> mpsc::Sender<PostedRequest> {
    let (tx, mut rx) = mpsc::channel::<PostedRequest>(1024);
    tokio::spawn(async move {
        while let Some(posted) = rx.recv().await {
            let components = Arc::clone(&components);
            tokio::spawn(async move {
                let id = posted.envelope.id.clone();
                let result = dispatch::dispatch(&components, &posted.envelope.verb, posted.envelope.params).await;
                let response = match result {
                    Ok(value) => serde_json::json!({"id": id, "ok": true, "result": value}),
                    Err(e) => {
                        error!(verb_error = %e, "bridge verb failed");
                        serde_json::json!({"id": id, "ok": false, "error": e.to_string()})
                    }
                };
                let _ = posted.respond_to.send(response);
            });
        }
    });
    tx
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct ModuleProfileParams {
    pub module_id: String,
    pub profile: String,
}
