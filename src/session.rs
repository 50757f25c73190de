// ===============================
// src/session.rs (valuation session loop)
// ===============================
//
// One task owns everything mutable: the connection manager, the snapshot
// store, the price reconciler and the notification sink. It reacts to
//   - connection transitions (drive)
//   - price events forwarded by subscription handlers
//   - fetch completions (fetches run in their own task)
//   - commands from the SessionHandle (refresh / shutdown)
// one at a time, and republishes the ViewState after each.
//
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::connection::{ConnectionConfig, ConnectionManager, Transition};
use crate::domain::{Notification, PortfolioSnapshot, PriceEvent, ViewError, ViewState};
use crate::error::{FetchError, TransportError};
use crate::fetch::ValuationClient;
use crate::notifications::NotificationSink;
use crate::reconciler::Reconciler;
use crate::store::SnapshotStore;
use crate::token::{identity_from_jwt, TokenSource};
use crate::transport::TransportFactory;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub portfolio_id: String,
    pub connection: ConnectionConfig,
    pub notifications: bool,
}

#[derive(Debug)]
enum SessionCmd {
    Refresh,
    Shutdown,
}

type FetchResult = (u64, Result<PortfolioSnapshot, FetchError>);

pub struct ValuationSession {
    cfg: SessionConfig,
    conn: ConnectionManager,
    store: SnapshotStore,
    reconciler: Reconciler,
    notifications: Option<NotificationSink>,
    tokens: Arc<dyn TokenSource>,
    client: ValuationClient,
    view_tx: watch::Sender<ViewState>,
    fetch_tx: mpsc::UnboundedSender<FetchResult>,
    fetch_seq: u64,
    loading: bool,
    error: Option<ViewError>,
}

/// Owner-side handle. Dropping it without `shutdown()` also ends the session
/// (the command channel closes).
pub struct SessionHandle {
    view: watch::Receiver<ViewState>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    cmd: mpsc::UnboundedSender<SessionCmd>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn view(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }

    /// Notification stream; handed out once.
    pub fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.take()
    }

    /// Re-fetch the snapshot, e.g. after the asset list was edited.
    pub fn refresh(&self) {
        let _ = self.cmd.send(SessionCmd::Refresh);
    }

    /// Unsubscribe everything, close the channel and wait for the loop to end.
    pub async fn shutdown(self) {
        let _ = self.cmd.send(SessionCmd::Shutdown);
        if let Err(e) = self.task.await {
            error!(?e, "session task failed");
        }
    }
}

impl ValuationSession {
    /// Spawn the session loop on the current runtime.
    pub fn start(
        cfg: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        tokens: Arc<dyn TokenSource>,
        client: ValuationClient,
    ) -> SessionHandle {
        let (view_tx, view_rx) = watch::channel(ViewState::default());
        let (price_tx, price_rx) = mpsc::unbounded_channel::<PriceEvent>();
        let (note_tx, note_rx) = mpsc::unbounded_channel::<Notification>();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel::<FetchResult>();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<SessionCmd>();

        let mut conn = ConnectionManager::new(cfg.connection.clone(), factory, tokens.clone());
        conn.on_error(Box::new(|e: &TransportError| warn!(error = %e, "session channel error")));
        let notifications = cfg.notifications.then(|| NotificationSink::new(note_tx));

        let session = ValuationSession {
            cfg,
            conn,
            store: SnapshotStore::new(),
            reconciler: Reconciler::new(price_tx),
            notifications,
            tokens,
            client,
            view_tx,
            fetch_tx,
            fetch_seq: 0,
            loading: false,
            error: None,
        };
        let task = tokio::spawn(session.run(price_rx, fetch_rx, cmd_rx));
        SessionHandle { view: view_rx, notifications: Some(note_rx), cmd: cmd_tx, task }
    }

    async fn run(
        mut self,
        mut price_rx: mpsc::UnboundedReceiver<PriceEvent>,
        mut fetch_rx: mpsc::UnboundedReceiver<FetchResult>,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    ) {
        info!(portfolio = %self.cfg.portfolio_id, "valuation session started");
        self.conn.open();
        self.start_fetch();

        loop {
            // Fixed branch order: a price already queued is merged before a
            // fetch result that arrived after it, so the snapshot wins.
            tokio::select! {
                biased;
                t = self.conn.drive() => self.on_transition(t),
                Some(ev) = price_rx.recv() => {
                    if self.store.apply(&ev) {
                        self.publish_view();
                    }
                }
                Some((seq, res)) = fetch_rx.recv() => self.on_fetched(seq, res),
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCmd::Refresh) => self.start_fetch(),
                    Some(SessionCmd::Shutdown) | None => break,
                },
            }
        }

        self.reconciler.unsubscribe_all(&mut self.conn);
        if let Some(sink) = self.notifications.as_mut() {
            sink.unsubscribe_all(&mut self.conn);
        }
        self.conn.close();
        self.publish_view();
        info!(portfolio = %self.cfg.portfolio_id, "valuation session stopped");
    }

    fn on_transition(&mut self, t: Transition) {
        match t {
            Transition::Connected => {
                self.reconcile();
                if let Some(sink) = self.notifications.as_mut() {
                    let identity = self.tokens.current().and_then(|t| identity_from_jwt(&t));
                    sink.on_connected(&mut self.conn, identity.as_deref());
                }
            }
            Transition::Disconnected => {
                self.reconciler.reset();
                if let Some(sink) = self.notifications.as_mut() {
                    sink.reset();
                }
            }
        }
        self.publish_view();
    }

    fn start_fetch(&mut self) {
        self.fetch_seq += 1;
        let seq = self.fetch_seq;
        self.loading = true;
        self.publish_view();

        let client = self.client.clone();
        let id = self.cfg.portfolio_id.clone();
        let tx = self.fetch_tx.clone();
        tokio::spawn(async move {
            let res = client.fetch(&id).await;
            let _ = tx.send((seq, res));
        });
    }

    fn on_fetched(&mut self, seq: u64, res: Result<PortfolioSnapshot, FetchError>) {
        if seq != self.fetch_seq {
            info!(seq, latest = self.fetch_seq, "dropping superseded fetch result");
            return;
        }
        self.loading = false;
        match res {
            Ok(snap) => {
                info!(portfolio = %snap.portfolio_name, assets = snap.assets.len(), total = snap.total_value, "snapshot loaded");
                self.error = None;
                self.store.replace(snap);
                self.reconcile();
            }
            Err(e) if e.is_auth() => {
                warn!(error = %e, "credential missing or rejected, sign-in required");
                self.error = Some(ViewError::AuthRequired);
            }
            Err(e) => {
                warn!(error = %e, "snapshot fetch failed");
                self.error = Some(ViewError::Fetch(e.to_string()));
            }
        }
        self.publish_view();
    }

    fn reconcile(&mut self) {
        if let Some(snap) = self.store.current() {
            self.reconciler.reconcile(&mut self.conn, &snap.symbols());
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(ViewState {
            snapshot: self.store.current(),
            connection: self.conn.state(),
            loading: self.loading,
            error: self.error.clone(),
        });
    }
}
