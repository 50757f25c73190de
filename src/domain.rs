// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

/// Lifecycle of the push channel, owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool { matches!(self, ConnectionState::Connected) }
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// One purchase lot. `quantity`, `purchase_price` and `total_cost` come from the
/// fetch and never change; the remaining four are derived by the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(rename = "assetId", alias = "id")]
    pub id: String,
    pub symbol: String,
    #[serde(deserialize_with = "de_number")]
    pub quantity: f64,
    #[serde(deserialize_with = "de_number")]
    pub purchase_price: f64,
    #[serde(deserialize_with = "de_number")]
    pub total_cost: f64,
    #[serde(deserialize_with = "de_number")]
    pub current_price: f64,
    #[serde(deserialize_with = "de_number")]
    pub market_value: f64,
    #[serde(deserialize_with = "de_number")]
    pub gain_loss: f64,
    #[serde(deserialize_with = "de_number")]
    pub gain_loss_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub portfolio_id: String,
    pub portfolio_name: String,
    #[serde(deserialize_with = "de_number")]
    pub total_value: f64,
    #[serde(deserialize_with = "de_number")]
    pub total_purchase_cost: f64,
    #[serde(deserialize_with = "de_number")]
    pub total_gain_loss: f64,
    #[serde(deserialize_with = "de_number")]
    pub total_gain_loss_percent: f64,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl PortfolioSnapshot {
    /// Distinct symbols held, in first-seen order.
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.assets.len());
        for a in &self.assets {
            if !out.iter().any(|s| s == &a.symbol) {
                out.push(a.symbol.clone());
            }
        }
        out
    }
}

/// Body of a `/topic/prices/{symbol}` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEvent {
    pub symbol: String,
    #[serde(deserialize_with = "de_number")]
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationScope { Global, Private }

impl NotificationScope {
    pub fn as_str(&self) -> &'static str {
        match self { NotificationScope::Global => "global", NotificationScope::Private => "private" }
    }
}

/// Body of a notification topic message. The broker sends the stored
/// notification record; only `message` is required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationBody {
    #[serde(alias = "text")]
    pub message: String,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub read: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub scope: NotificationScope,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

/// What the rendering layer can show when there is no usable snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    /// Credential missing or rejected; the user must sign in again.
    AuthRequired,
    Fetch(String),
}

/// Everything the rendering layer reads.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub snapshot: Option<Arc<PortfolioSnapshot>>,
    pub connection: ConnectionState,
    pub loading: bool,
    pub error: Option<ViewError>,
}

impl ViewState {
    pub fn is_connected(&self) -> bool { self.connection.is_connected() }
}

// The producer serializes big decimals; depending on its Jackson settings they
// arrive as JSON numbers or as numeric strings. NaN and infinities are refused.
fn de_number<'de, D>(de: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num { F(f64), S(String) }

    let v = match Num::deserialize(de)? {
        Num::F(v) => v,
        Num::S(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom)?,
    };
    if !v.is_finite() {
        return Err(serde::de::Error::custom(format!("non-finite number {v}")));
    }
    Ok(v)
}
