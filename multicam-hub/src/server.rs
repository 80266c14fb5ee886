//! WebSocket front end for control panels.
//!
//! Architecture:
//! ```text
//! Panel A ──┐                    ┌── reader loop ── Intent::parse ── SyncHub
//!            ├── accept_loop ────┤
//! Panel B ──┘                    └── writer task ◄── outbound queue ◄── ConnectionRegistry
//! ```
//!
//! Each connection runs one reader loop and one writer task. The reader never
//! waits for a device: save/recall/fleet intents are queued on the hub and
//! their results are reported from a separate task.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{FleetReport, HubError, SyncHub};
use crate::protocol::Intent;
use crate::registry::SessionId;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6789".to_string(),
        }
    }
}

/// The panel-facing WebSocket server.
pub struct HubServer {
    config: ServerConfig,
    hub: SyncHub,
}

impl HubServer {
    pub fn new(config: ServerConfig, hub: SyncHub) -> Self {
        Self { config, hub }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &SyncHub {
        &self.hub
    }

    /// Bind the configured address. Failing here is fatal for the process.
    pub async fn bind(&self) -> Result<TcpListener, HubError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| HubError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Run the server until the process ends.
    pub async fn run(&self) -> Result<(), HubError> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), HubError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve_until(listener, shutdown).await;
        Ok(())
    }

    /// Accept panels on an already bound listener until `shutdown` resolves.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        match listener.local_addr() {
            Ok(addr) => log::info!("Hub server listening on {addr}"),
            Err(_) => log::info!("Hub server listening on {}", self.config.bind_addr),
        }

        tokio::select! {
            _ = shutdown => {
                log::info!("Shutdown signal received");
            }
            _ = self.accept_loop(&listener) => {}
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    let hub = self.hub.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(hub, stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                }
            }
        }
    }
}

/// Serve one panel: snapshot first, then intents in, broadcasts out.
async fn handle_connection(
    hub: SyncHub,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (session, mut outbound) = hub.connect().await?;
    log::info!("Panel {addr} connected as session {session}");

    // Writer task: drain the session queue. Ends when the registry drops the
    // queue (disconnect or eviction) or the socket fails.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if ws_sender.send(Message::text(message.to_string())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&hub, session, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Panel {addr} closed the connection");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("Session {session}: ignoring binary frame");
                    }
                    // Pings are answered by the WebSocket layer
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Session {session}: read error: {e}");
                        break;
                    }
                }
            }
            _ = &mut writer => {
                log::info!("Session {session}: outbound side closed");
                break;
            }
        }
    }

    hub.disconnect(&session).await;
    Ok(())
}

/// Validate one frame and hand it to the hub.
async fn dispatch(hub: &SyncHub, session: SessionId, raw: &str) {
    let intent = match Intent::parse(raw) {
        Ok(intent) => intent,
        Err(e) => {
            log::warn!("Session {session}: dropping frame: {e}");
            return;
        }
    };
    let event = intent.event_name();
    log::debug!("Session {session}: {event}");

    match intent {
        Intent::UpdateButton { key, .. } if key.camera >= hub.camera_count() => {
            log::warn!("Session {session}: dropping {event} for unknown camera {}", key.camera);
        }
        Intent::UpdateButton { key, value } => {
            hub.handle_button_update(session, Arc::from(raw), key, value).await;
        }
        Intent::SavePosition(position) => {
            report_outcome(hub, session, event, hub.handle_save_position(position));
        }
        Intent::RecallPosition(position) => {
            report_outcome(hub, session, event, hub.handle_recall_position(position));
        }
        Intent::Power(on) => report_fleet(hub, session, event, hub.handle_power(on)),
        Intent::FocusLock(on) => report_fleet(hub, session, event, hub.handle_focus_lock(on)),
    }
}

fn report_outcome<T, F>(hub: &SyncHub, session: SessionId, event: &'static str, outcome: F)
where
    F: Future<Output = Result<T, HubError>> + Send + 'static,
    T: Send + 'static,
{
    let hub = hub.clone();
    tokio::spawn(async move {
        if let Err(e) = outcome.await {
            hub.report_failure(&session, event, &e).await;
        }
    });
}

fn report_fleet<F>(hub: &SyncHub, session: SessionId, event: &'static str, outcome: F)
where
    F: Future<Output = FleetReport> + Send + 'static,
{
    let hub = hub.clone();
    tokio::spawn(async move {
        let report = outcome.await;
        hub.report_fleet(&session, event, &report).await;
    });
}
