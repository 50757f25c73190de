// ===============================
// src/merge.rs (valuation merge)
// ===============================
use crate::domain::{PortfolioSnapshot, PriceEvent};

fn pct(gain: f64, cost: f64) -> f64 {
    if cost == 0.0 { 0.0 } else { gain / cost * 100.0 }
}

/// Fold one price into the snapshot. Returns `None` when no asset carries the
/// symbol, in which case nothing should be published.
///
/// The result is built completely before it is returned; totals are always a
/// fresh sum over every asset so `total_value == Σ market_value` holds exactly.
/// Last received price wins: events carry no sequence number.
pub fn apply_price(snap: &PortfolioSnapshot, ev: &PriceEvent) -> Option<PortfolioSnapshot> {
    if !snap.assets.iter().any(|a| a.symbol == ev.symbol) {
        return None;
    }
    let mut next = snap.clone();
    for a in next.assets.iter_mut().filter(|a| a.symbol == ev.symbol) {
        a.current_price = ev.price;
        a.market_value = a.quantity * a.current_price;
        a.gain_loss = a.market_value - a.total_cost;
        a.gain_loss_percent = pct(a.gain_loss, a.total_cost);
    }
    next.total_value = next.assets.iter().map(|a| a.market_value).sum();
    next.total_gain_loss = next.total_value - next.total_purchase_cost;
    next.total_gain_loss_percent = pct(next.total_gain_loss, next.total_purchase_cost);
    Some(next)
}
