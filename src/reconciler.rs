// ===============================
// src/reconciler.rs (price subscriptions)
// ===============================
use ahash::AHashMap as HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::{ConnectionManager, SubscriptionHandle};
use crate::domain::PriceEvent;
use crate::metrics::ACTIVE_SUBSCRIPTIONS;

pub fn price_topic(symbol: &str) -> String {
    format!("/topic/prices/{symbol}")
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Subscribe refused (not connected); picked up on the next Connected.
    pub deferred: Vec<String>,
}

/// Keeps one price subscription per held symbol. Every handler forwards into
/// the same `prices` channel, drained by the session loop.
pub struct Reconciler {
    active: HashMap<String, SubscriptionHandle>,
    prices: mpsc::UnboundedSender<PriceEvent>,
}

impl Reconciler {
    pub fn new(prices: mpsc::UnboundedSender<PriceEvent>) -> Self {
        Self { active: HashMap::new(), prices }
    }

    /// Symbols with a live subscription, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.active.keys().cloned().collect();
        v.sort();
        v
    }

    /// Subscribe `desired - active`, unsubscribe `active - desired`.
    pub fn reconcile(&mut self, conn: &mut ConnectionManager, desired: &[String]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // handles killed by a disconnect we have not been told about yet
        self.active.retain(|_, h| conn.is_active(h));

        let stale: Vec<String> = self
            .active
            .keys()
            .filter(|s| !desired.contains(s))
            .cloned()
            .collect();
        for symbol in stale {
            if let Some(h) = self.active.remove(&symbol) {
                conn.unsubscribe(h);
                report.removed.push(symbol);
            }
        }

        for symbol in desired {
            if self.active.contains_key(symbol) || report.deferred.contains(symbol) {
                continue;
            }
            let tx = self.prices.clone();
            let handler = move |ev: PriceEvent| {
                if let Err(e) = tx.send(ev) {
                    debug!(symbol = %e.0.symbol, "session gone, price event dropped");
                }
            };
            match conn.subscribe(&price_topic(symbol), handler) {
                Some(h) => {
                    self.active.insert(symbol.clone(), h);
                    report.added.push(symbol.clone());
                }
                None => report.deferred.push(symbol.clone()),
            }
        }

        ACTIVE_SUBSCRIPTIONS.set(self.active.len() as i64);
        if !report.added.is_empty() || !report.removed.is_empty() {
            info!(added = ?report.added, removed = ?report.removed, active = self.active.len(), "price subscriptions reconciled");
        } else if !report.deferred.is_empty() {
            debug!(deferred = ?report.deferred, "price subscriptions deferred until connected");
        }
        report
    }

    /// Forget every entry after the transport dropped; the handles are already
    /// dead so nothing is sent.
    pub fn reset(&mut self) {
        self.active.clear();
        ACTIVE_SUBSCRIPTIONS.set(0);
    }

    pub fn unsubscribe_all(&mut self, conn: &mut ConnectionManager) {
        for (_, h) in self.active.drain() {
            conn.unsubscribe(h);
        }
        ACTIVE_SUBSCRIPTIONS.set(0);
    }
}
