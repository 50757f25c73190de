// ===============================
// src/main.rs
// ===============================
/*
 # run against a local gateway
 PORTFOLIO_ID=<uuid> AUTH_TOKEN=<jwt> cargo run --release

 # channel health / merge activity
 curl -s localhost:9899/metrics | egrep '^(channel_connected|price_events_total|active_price_subscriptions)'
*/
use clap::Parser;
use std::future::pending;
use std::sync::Arc;
use tokio::{select, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use valuation_sync::config::{self, Cli};
use valuation_sync::domain::{Notification, NotificationScope, ViewError, ViewState};
use valuation_sync::fetch::ValuationClient;
use valuation_sync::metrics;
use valuation_sync::session::ValuationSession;
use valuation_sync::token::{FileTokenSource, StaticTokenSource, TokenSource};
use valuation_sync::transport::{redact, WsTransportFactory};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cli = Cli::parse();
    let settings = match config::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();
    if settings.metrics_port != 0 {
        metrics::serve_metrics(settings.metrics_port);
    }

    info!(
        api = %settings.api_base,
        channel = %redact(&settings.channel_url),
        portfolio = %settings.portfolio_id,
        reconnect_ms = settings.reconnect_delay.as_millis() as u64,
        notifications = settings.notifications,
        "startup config"
    );

    // ---- Credential ----
    let tokens: Arc<dyn TokenSource> = match &settings.auth_token {
        Some(t) => Arc::new(StaticTokenSource::new(Some(t.clone()))),
        None => Arc::new(FileTokenSource::new(&settings.token_file)),
    };
    if tokens.current().is_none() {
        warn!(file = %settings.token_file.display(), "no credential found, sign in first");
    }

    // ---- Session ----
    let client = ValuationClient::new(settings.api_base.clone(), tokens.clone());
    let mut session = ValuationSession::start(settings.session(), Arc::new(WsTransportFactory), tokens, client);
    let mut view = session.view();
    let mut notes = session.notifications();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let v = view.borrow_and_update().clone();
                render(&v);
            }
            Some(n) = next_note(&mut notes) => show_note(&n),
            _ = &mut ctrl_c => {
                info!("ctrl-c, shutting down");
                break;
            }
        }
    }
    session.shutdown().await;
}

async fn next_note(rx: &mut Option<mpsc::UnboundedReceiver<Notification>>) -> Option<Notification> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

fn show_note(n: &Notification) {
    match n.scope {
        NotificationScope::Global => info!(at = %n.received_at.format("%H:%M:%S"), "[global] {}", n.message),
        NotificationScope::Private => info!(at = %n.received_at.format("%H:%M:%S"), "[you] {}", n.message),
    }
}

fn render(v: &ViewState) {
    let live = if v.is_connected() { "Live" } else { "Disconnected" };
    match (&v.snapshot, &v.error) {
        (None, Some(ViewError::AuthRequired)) => {
            warn!("session expired or missing, sign in again");
            return;
        }
        (None, Some(ViewError::Fetch(msg))) => {
            error!(%msg, "could not load portfolio");
            return;
        }
        (None, None) => {
            info!(status = live, loading = v.loading, "waiting for portfolio");
            return;
        }
        (Some(_), Some(e)) => warn!(?e, "showing last known values"),
        (Some(_), None) => {}
    }
    let Some(s) = &v.snapshot else { return };
    info!(
        status = live,
        "{} | value {:.2} | cost {:.2} | P/L {:+.2} ({:+.2}%)",
        s.portfolio_name, s.total_value, s.total_purchase_cost, s.total_gain_loss, s.total_gain_loss_percent
    );
    for a in &s.assets {
        info!(
            "  {:<8} qty {:>10.4} @ {:>10.2}  value {:>12.2}  P/L {:>+10.2} ({:>+7.2}%)",
            a.symbol, a.quantity, a.current_price, a.market_value, a.gain_loss, a.gain_loss_percent
        );
    }
}
