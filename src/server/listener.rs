//! WebSocket accept loop
//!
//! Each client connection gets its own task. Requests of one connection are
//! answered in order; connections run in parallel.

use anyhow::{Context, Result};
use async_tungstenite::tokio::accept_async;
use async_tungstenite::tungstenite::{Message, Utf8Bytes};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::pipeline::dispatcher::RelocalizationDispatcher;
use crate::server::service::Connection;

/// Accept clients until `cancel` fires
pub async fn serve(
    addr: SocketAddr,
    dispatcher: Arc<RelocalizationDispatcher>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;
    info!("Server listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Server: accept loop stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Incoming connection from {}", peer);
                    let dispatcher = Arc::clone(&dispatcher);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, dispatcher, cancel).await {
                            warn!("Connection {}: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Server: accept failed: {}", e),
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<RelocalizationDispatcher>,
    cancel: CancellationToken,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut connection = Connection::new(peer.to_string(), dispatcher);
    info!("Client connected: {}", peer);

    let outcome: Result<()> = async {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = ws_receiver.next() => message,
            };

            let reply = match message {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Err(e)) => return Err(e).context("receive failed"),
                Some(Ok(Message::Text(text))) => connection.handle_text(text.as_str()).await,
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => connection.handle_text(text).await,
                    Err(e) => connection.reject(&format!("binary frame is not UTF-8: {}", e)),
                },
                Some(Ok(_)) => continue,
            };

            ws_sender
                .send(Message::Text(Utf8Bytes::from(reply)))
                .await
                .context("send failed")?;
        }
        Ok(())
    }
    .await;

    connection.close().await;
    info!("Client disconnected: {}", peer);
    outcome
}
