//! WebSocket bridge
//!
//! Accepts socket connections and bridges each one to the distribution hub:
//! outbound JSON payloads drain from the per-client queue into the socket,
//! inbound text frames parse as subscriber protocol requests. The hub never
//! touches sockets directly.

use anyhow::Context;
use can_telemetry::hub::{ClientRequest, DistributionHub};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Bind and serve until cancelled
pub async fn run(
    bind: &str,
    hub: Arc<DistributionHub>,
    client_queue_capacity: usize,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    log::info!("WebSocket listener on {}", bind);
    serve(listener, hub, client_queue_capacity, cancel).await;
    Ok(())
}

/// Accept loop over an already-bound listener
pub async fn serve(
    listener: TcpListener,
    hub: Arc<DistributionHub>,
    client_queue_capacity: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let hub = hub.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, hub, client_queue_capacity, cancel)
                                .await;
                        });
                    }
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                    }
                }
            }
        }
    }
    log::info!("WebSocket listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<DistributionHub>,
    client_queue_capacity: usize,
    cancel: CancellationToken,
) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut sink, mut source) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(client_queue_capacity);
    let id = hub.register(tx).await;
    log::debug!("Client {} is {}", id, addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = rx.recv() => {
                // None means the hub dropped this connection (liveness timeout)
                let Some(payload) = payload else { break };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientRequest>(&text) {
                            Ok(request) => hub.handle_request(id, request).await,
                            Err(e) => {
                                log::debug!("Client {} sent unparseable request: {}", id, e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Client {} socket error: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(id).await;
    let _ = sink.send(Message::Close(None)).await;
}
