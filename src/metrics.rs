// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{debug, error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Valuation stream --------
pub static PRICE_EVENTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("price_events_total", "price events merged into the snapshot").unwrap());

pub static PRICE_EVENTS_IGNORED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "price_events_ignored_total",
        "price events for symbols not held (or before the first snapshot)",
    )
    .unwrap()
});

pub static MALFORMED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("malformed_messages_total", "inbound messages dropped as undecodable"),
        &["kind"],
    )
    .unwrap()
});

pub static PORTFOLIO_TOTAL_VALUE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_total_value", "current total market value").unwrap());

// -------- Channel health --------
pub static CHANNEL_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("channel_connected", "1 if the STOMP channel is connected, 0 otherwise").unwrap()
});

pub static CHANNEL_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("channel_reconnects_total", "scheduled channel reconnect attempts").unwrap()
});

pub static ACTIVE_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("active_price_subscriptions", "price topics currently subscribed").unwrap()
});

// -------- Fetch / notifications --------
pub static SNAPSHOT_FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snapshot_fetches_total", "valuation snapshot fetches (label: outcome)"),
        &["outcome"],
    )
    .unwrap()
});

pub static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("notifications_total", "notifications delivered (label: scope)"),
        &["scope"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(PRICE_EVENTS.clone())),
        REGISTRY.register(Box::new(PRICE_EVENTS_IGNORED.clone())),
        REGISTRY.register(Box::new(MALFORMED.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_TOTAL_VALUE.clone())),
        REGISTRY.register(Box::new(CHANNEL_CONNECTED.clone())),
        REGISTRY.register(Box::new(CHANNEL_RECONNECTS.clone())),
        REGISTRY.register(Box::new(ACTIVE_SUBSCRIPTIONS.clone())),
        REGISTRY.register(Box::new(SNAPSHOT_FETCHES.clone())),
        REGISTRY.register(Box::new(NOTIFICATIONS.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buf) {
        error!(?e, "metrics encoding failed");
        buf.clear();
    }
    if buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Request line -> (status line, body). Only the scrape paths are served.
fn respond(request_line: &str) -> (&'static str, Vec<u8>) {
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some("/" | "/metrics")) => ("200 OK", encode_metrics()),
        (Some("GET"), Some(_)) => ("404 Not Found", b"not found\n".to_vec()),
        _ => ("405 Method Not Allowed", Vec::new()),
    }
}

fn scrape(stream: TcpStream) -> std::io::Result<()> {
    let mut request_line = String::new();
    BufReader::new(&stream).read_line(&mut request_line)?;
    let (status, body) = respond(&request_line);

    let mut out = &stream;
    write!(
        out,
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    out.write_all(&body)?;
    out.flush()
}

/// Scrape endpoint on its own OS thread; a failed bind only disables it.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let listener = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, port, "metrics bind failed, endpoint disabled");
                return;
            }
        };
        info!(port, "metrics endpoint up at /metrics");

        for stream in listener.incoming().filter_map(|s| s.map_err(|e| error!(?e, "metrics accept")).ok()) {
            if let Err(e) = scrape(stream) {
                debug!(?e, "metrics scrape aborted");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        init();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("# TYPE price_events_total counter"));
        assert!(text.contains("channel_connected"));
    }

    #[test]
    fn only_scrape_paths_are_served() {
        init();
        let (status, body) = respond("GET /metrics HTTP/1.1\r\n");
        assert_eq!(status, "200 OK");
        assert!(String::from_utf8(body).unwrap().contains("price_events_total"));
        assert_eq!(respond("GET / HTTP/1.1\r\n").0, "200 OK");
        assert_eq!(respond("GET /favicon.ico HTTP/1.1\r\n").0, "404 Not Found");
        assert_eq!(respond("POST /metrics HTTP/1.1\r\n").0, "405 Method Not Allowed");
        assert_eq!(respond("").0, "405 Method Not Allowed");
    }
}
