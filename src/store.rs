// ===============================
// src/store.rs (snapshot store)
// ===============================
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{PortfolioSnapshot, PriceEvent};
use crate::merge::apply_price;
use crate::metrics::{PORTFOLIO_TOTAL_VALUE, PRICE_EVENTS, PRICE_EVENTS_IGNORED};

/// Sole owner of the current snapshot. Readers hold a `watch::Receiver` and
/// only ever see complete snapshots.
pub struct SnapshotStore {
    tx: watch::Sender<Option<Arc<PortfolioSnapshot>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self { Self::new() }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<PortfolioSnapshot>>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Arc<PortfolioSnapshot>> {
        self.tx.borrow().clone()
    }

    /// Wholesale replacement from an authoritative fetch.
    pub fn replace(&self, snap: PortfolioSnapshot) {
        PORTFOLIO_TOTAL_VALUE.set(snap.total_value);
        self.tx.send_replace(Some(Arc::new(snap)));
    }

    /// Merge one price event. Returns true when a new snapshot was published.
    /// Events arriving before the first fetch are dropped.
    pub fn apply(&self, ev: &PriceEvent) -> bool {
        let Some(cur) = self.current() else {
            PRICE_EVENTS_IGNORED.inc();
            debug!(symbol = %ev.symbol, "price before first snapshot, ignored");
            return false;
        };
        match apply_price(&cur, ev) {
            Some(next) => {
                PRICE_EVENTS.inc();
                PORTFOLIO_TOTAL_VALUE.set(next.total_value);
                self.tx.send_replace(Some(Arc::new(next)));
                true
            }
            None => {
                PRICE_EVENTS_IGNORED.inc();
                debug!(symbol = %ev.symbol, "price for symbol not held, ignored");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Asset;

    fn snap(px: f64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            portfolio_id: "p".into(),
            portfolio_name: "n".into(),
            total_value: 10.0 * px,
            total_purchase_cost: 1000.0,
            total_gain_loss: 10.0 * px - 1000.0,
            total_gain_loss_percent: 0.0,
            assets: vec![Asset {
                id: "a".into(), symbol: "AAPL".into(), quantity: 10.0, purchase_price: 100.0,
                total_cost: 1000.0, current_price: px, market_value: 10.0 * px,
                gain_loss: 10.0 * px - 1000.0, gain_loss_percent: 0.0,
            }],
        }
    }

    #[test]
    fn apply_before_seed_is_dropped() {
        let store = SnapshotStore::new();
        assert!(!store.apply(&PriceEvent { symbol: "AAPL".into(), price: 1.0 }));
        assert!(store.current().is_none());
    }

    #[test]
    fn readers_see_merged_and_replaced_snapshots() {
        let store = SnapshotStore::new();
        let mut rx = store.subscribe();
        store.replace(snap(100.0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().total_value, 1000.0);

        assert!(store.apply(&PriceEvent { symbol: "AAPL".into(), price: 120.0 }));
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().total_value, 1200.0);

        assert!(!store.apply(&PriceEvent { symbol: "TSLA".into(), price: 5.0 }));
        assert!(!rx.has_changed().unwrap());

        // fetch overwrites whatever the stream produced
        store.replace(snap(90.0));
        assert_eq!(store.current().unwrap().total_value, 900.0);
    }
}
