// ===============================
// src/transport.rs
// ===============================
//
// Channel transport adapters. A factory opens one link per connection
// attempt; the link is a pair of channels so the connection manager never
// touches the socket directly:
//   outbound : text frames to write
//   inbound  : Opened / Text / Closed / Error events
// Dropping the link closes the socket.
//
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Text(String),
    Closed(Option<String>),
    Error(TransportError),
}

pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

pub trait TransportFactory: Send + Sync {
    fn open(&self, url: &Url) -> TransportLink;
}

/// Strip the credential before a URL goes anywhere near a log line.
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    if url.query_pairs().any(|(k, _)| k == "token") {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let v = if k == "token" { "***".to_string() } else { v.into_owned() };
                (k.into_owned(), v)
            })
            .collect();
        shown.query_pairs_mut().clear().extend_pairs(kept);
    }
    shown.to_string()
}

/// WebSocket transport (tokio-tungstenite).
#[derive(Debug, Default, Clone)]
pub struct WsTransportFactory;

impl TransportFactory for WsTransportFactory {
    fn open(&self, url: &Url) -> TransportLink {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
        tokio::spawn(pump(url.clone(), out_rx, in_tx));
        TransportLink { outbound: out_tx, inbound: in_rx }
    }
}

async fn pump(
    url: Url,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let shown = redact(&url);
    info!(url = %shown, "connecting channel");
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _resp)) => ws,
        Err(e) => {
            let _ = in_tx.send(TransportEvent::Error(TransportError::Connect(e.to_string())));
            let _ = in_tx.send(TransportEvent::Closed(None));
            return;
        }
    };
    if in_tx.send(TransportEvent::Opened).is_err() {
        return;
    }
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(TransportEvent::Text(text)).is_err() { break; }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if in_tx.send(TransportEvent::Text(text)).is_err() { break; }
                        }
                        Err(e) => warn!(?e, "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            let _ = in_tx.send(TransportEvent::Error(TransportError::Socket(e.to_string())));
                            let _ = in_tx.send(TransportEvent::Closed(None));
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        let _ = in_tx.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = in_tx.send(TransportEvent::Error(TransportError::Socket(e.to_string())));
                        let _ = in_tx.send(TransportEvent::Closed(None));
                        return;
                    }
                    None => {
                        let _ = in_tx.send(TransportEvent::Closed(None));
                        return;
                    }
                }
            }
            out = out_rx.recv() => {
                match out {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            let _ = in_tx.send(TransportEvent::Error(TransportError::Socket(e.to_string())));
                            let _ = in_tx.send(TransportEvent::Closed(None));
                            return;
                        }
                    }
                    // link dropped by the manager
                    None => break,
                }
            }
        }
    }
    debug!(url = %shown, "closing channel socket");
    let _ = write.send(Message::Close(None)).await;
    let _ = write.close().await;
}
