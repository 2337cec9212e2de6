//! Relay server: WebSocket front end
//!
//! Every WebSocket connection becomes one relay session. Binary frames carry
//! BSON requests in and BSON events out. Readiness is polled by the relay's
//! reactor thread, which wakes the connection's task through a `Notify`.
//!
//! Usage:
//!     ./target/release/relay [port]
//!
//! Configuration comes from `RELAY_*` environment variables; `RELAY_LOG`
//! sets the log filter. A port argument overrides `RELAY_LISTEN_ADDR`'s port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use relay_core::RelayConfig;
use relay_session::Relay;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// How often pending connects are checked against the connect timeout.
const EXPIRY_TICK: Duration = Duration::from_secs(1);

/// Bytes of a frame that carries a BSON request. Only binary frames do.
fn request_payload(msg: &Message) -> Option<&[u8]> {
    match msg {
        Message::Binary(data) => Some(data.as_slice()),
        _ => None,
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, relay: Arc<Relay>) {
    let _ = stream.set_nodelay(true);
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let wake = Arc::new(Notify::new());
    let waker = wake.clone();
    let mut session = relay.open_session(
        move |frame: Vec<u8>| {
            let _ = tx.send(frame);
        },
        move || waker.notify_one(),
    );
    let session_id = session.id();
    info!(session = session_id, %peer, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut expiry = tokio::time::interval(EXPIRY_TICK);
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(msg)) => match request_payload(&msg) {
                    Some(data) => session.on_message(data),
                    None if msg.is_text() => debug!(session = session_id, "ignoring text frame"),
                    // Ping/pong is answered by tungstenite.
                    None => {}
                },
                Some(Err(e)) => {
                    debug!(session = session_id, error = %e, "websocket read failed");
                    break;
                }
            },
            _ = wake.notified() => {
                session.drain_mailbox();
            }
            _ = expiry.tick() => {
                session.expire_stalled_connects(Instant::now());
            }
        }
    }

    session.on_close();
    // Dropping the session drops the frame sender, which ends the writer.
    drop(session);
    let _ = writer.await;
    info!(session = session_id, %peer, "client disconnected");
}

#[tokio::main]
async fn main() {
    relay_core::log::init();

    let mut config = RelayConfig::from_env();
    if let Some(arg) = std::env::args().nth(1) {
        match arg.parse::<u16>() {
            Ok(port) => config = config.listen_port(port),
            Err(_) => {
                error!(arg = %arg, "port argument must be a number in 0..=65535");
                std::process::exit(2);
            }
        }
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }
    config.log_summary();

    let addr = config.listen_addr;
    let relay = match Relay::start(config) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    info!(%addr, "relay: listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_client(stream, peer, Arc::clone(&relay)));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("relay: shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_binary_frames_carry_requests() {
        let bytes = vec![0x05, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(request_payload(&Message::Binary(bytes.clone())), Some(bytes.as_slice()));
        assert_eq!(request_payload(&Message::Text(r#"{"method":"socket"}"#.into())), None);
        assert_eq!(request_payload(&Message::Ping(vec![1])), None);
    }
}
