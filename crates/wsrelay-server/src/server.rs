//! Local gateway: stands in for the managed WebSocket gateway and the
//! backend trigger so the relay can run as a single process.
//!
//! Two WebSocket listeners are started. The client listener assigns each
//! socket a connection id, registers its outbound queue with
//! [`LocalConnections`] and turns socket activity into gateway events. The
//! backend listener accepts `Response`/`Publish` frames from business
//! functions and answers each with `{"statusCode": ...}`.
//!
//! Every event and every backend frame is handled in its own task, so no
//! ordering holds between frames of one socket. A Subscribe still in flight
//! when the socket closes can land after the DISCONNECT cleanup and leave an
//! orphaned subscription until a publish finds the connection gone.

use crate::config::ServerConfig;
use crate::delivery::local::generate_connection_id;
use crate::delivery::LocalConnections;
use crate::handler::{status_code, BackendHandler, GatewayEvent, GatewayHandler};
use crate::invoke::{DisabledInvoker, HttpInvoker, Invoker};
use crate::store::{KvStore, RoutingStore};
use crate::transport::websocket::{self, WebSocketConnection};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wsrelay_core::{Client, RelayError, RelayResult};

/// Reply to one backend ingress frame.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngressAck {
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct RelayServer {
    config: ServerConfig,
    store: RoutingStore,
    connections: Arc<LocalConnections>,
    gateway: Arc<GatewayHandler>,
    backend: Arc<BackendHandler>,
}

/// Addresses and tasks of a started server.
pub struct Listening {
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Listening {
    /// Stop accepting and drop the sweep task. Open sockets are left to
    /// their own tasks.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

impl RelayServer {
    pub fn new(config: ServerConfig, kv: Arc<dyn KvStore>) -> Self {
        let store = RoutingStore::new(kv);
        let connections = Arc::new(LocalConnections::new());

        let invoker: Arc<dyn Invoker> = match &config.invoke_url {
            Some(url) => Arc::new(HttpInvoker::new(url.clone(), config.invoke_timeout_secs)),
            None => {
                warn!("no invoke base_url configured, Request messages will fail");
                Arc::new(DisabledInvoker)
            }
        };
        if config.routes.is_empty() {
            warn!("routing map is empty");
        }

        let gateway = Arc::new(GatewayHandler::new(
            store.clone(),
            invoker,
            Arc::new(config.routes.clone()),
        ));
        let backend = Arc::new(
            BackendHandler::new(store.clone(), connections.clone())
                .with_fanout_policy(config.fanout)
                .with_stale_pruning(config.prune_stale),
        );

        Self {
            config,
            store,
            connections,
            gateway,
            backend,
        }
    }

    pub fn connections(&self) -> &Arc<LocalConnections> {
        &self.connections
    }

    /// Bind both listeners and start serving in background tasks.
    pub async fn start(self) -> RelayResult<Listening> {
        let server = Arc::new(self);

        let client_bind = bind_addr(server.config.port)?;
        let backend_bind = bind_addr(server.config.backend_port)?;
        let (client_addr, mut client_rx) = websocket::start_listener(client_bind, "client").await?;
        let (backend_addr, mut backend_rx) =
            websocket::start_listener(backend_bind, "backend").await?;

        let mut tasks = Vec::new();

        let s = server.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(conn) = client_rx.recv().await {
                tokio::spawn(s.clone().handle_client(conn));
            }
        }));

        let s = server.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(conn) = backend_rx.recv().await {
                tokio::spawn(s.clone().handle_backend(conn));
            }
        }));

        if server.config.sweep_interval > 0 {
            let store = server.store.clone();
            let every = Duration::from_secs(server.config.sweep_interval);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match store.sweep().await {
                        Ok(report) if report.is_clean() => debug!("sweep found nothing"),
                        Ok(report) => info!(
                            forward_orphans = report.forward_orphans,
                            reverse_orphans = report.reverse_orphans,
                            corrupt = report.corrupt,
                            "sweep repaired routing store"
                        ),
                        Err(e) => warn!(error = %e, "sweep failed"),
                    }
                }
            }));
        }

        info!(
            client = %client_addr,
            backend = %backend_addr,
            domain = %server.config.domain,
            stage = %server.config.stage,
            "relay listening"
        );
        Ok(Listening {
            client_addr,
            backend_addr,
            tasks,
        })
    }

    /// Run one gateway event in its own task.
    fn dispatch(self: &Arc<Self>, event: GatewayEvent) {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let response = gateway.respond(&event).await;
            debug!(
                connection_id = %event.connection_id,
                event = ?event.event_type,
                status = response.status_code,
                "gateway event handled"
            );
        });
    }

    async fn handle_client(self: Arc<Self>, conn: WebSocketConnection) {
        let connection_id = generate_connection_id();
        let client = Client::new(&connection_id, &self.config.domain, &self.config.stage);
        let mut outbound = self.connections.register(&connection_id).await;
        let mut ws = conn.ws_stream;

        info!(connection_id = %connection_id, remote = %conn.remote_addr, "client connected");
        self.dispatch(GatewayEvent::connect(&client));

        loop {
            tokio::select! {
                frame = websocket::ws_recv_text(&mut ws) => match frame {
                    Ok(Some(body)) => self.dispatch(GatewayEvent::message(&client, body)),
                    Ok(None) => break,
                    Err(RelayError::Transport(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "client socket error");
                        break;
                    }
                    Err(e) => warn!(connection_id = %connection_id, error = %e, "client frame dropped"),
                },
                Some(data) = outbound.recv() => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if let Err(e) = websocket::ws_send_text(&mut ws, text).await {
                        debug!(connection_id = %connection_id, error = %e, "client send failed");
                        break;
                    }
                }
            }
        }

        self.connections.unregister(&connection_id).await;
        info!(connection_id = %connection_id, "client disconnected");
        self.dispatch(GatewayEvent::disconnect(&client));
    }

    async fn handle_backend(self: Arc<Self>, conn: WebSocketConnection) {
        let remote = conn.remote_addr;
        let mut ws = conn.ws_stream;
        let (ack_tx, mut ack_rx) = mpsc::channel::<String>(64);
        debug!(remote = %remote, "backend connected");

        loop {
            tokio::select! {
                frame = websocket::ws_recv_text(&mut ws) => match frame {
                    Ok(Some(body)) => {
                        let backend = self.backend.clone();
                        let ack_tx = ack_tx.clone();
                        tokio::spawn(async move {
                            let result = backend.handle_bytes(body.as_bytes()).await;
                            if let Err(ref e) = result {
                                warn!(error = %e, "backend message failed");
                            }
                            let ack = IngressAck {
                                status_code: status_code(&result),
                                error: result.err().map(|e| e.to_string()),
                            };
                            if let Ok(text) = serde_json::to_string(&ack) {
                                let _ = ack_tx.send(text).await;
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(RelayError::Transport(e)) => {
                        debug!(remote = %remote, error = %e, "backend socket error");
                        break;
                    }
                    Err(e) => warn!(remote = %remote, error = %e, "backend frame dropped"),
                },
                Some(text) = ack_rx.recv() => {
                    if let Err(e) = websocket::ws_send_text(&mut ws, text).await {
                        debug!(remote = %remote, error = %e, "backend ack failed");
                        break;
                    }
                }
            }
        }
        debug!(remote = %remote, "backend disconnected");
    }
}

fn bind_addr(port: u16) -> RelayResult<SocketAddr> {
    format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| RelayError::Other(format!("invalid address: {e}")))
}
