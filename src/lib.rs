// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod metrics;
pub mod notifications;
pub mod reconciler;
pub mod session;
pub mod stomp;
pub mod store;
pub mod token;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionManager, SubscriptionHandle, Transition};
pub use domain::{ConnectionState, Notification, PortfolioSnapshot, PriceEvent, ViewError, ViewState};
pub use session::{SessionConfig, SessionHandle, ValuationSession};
