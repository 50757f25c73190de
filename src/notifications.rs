// ===============================
// src/notifications.rs
// ===============================
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connection::{ConnectionManager, SubscriptionHandle};
use crate::domain::{Notification, NotificationBody, NotificationScope};
use crate::metrics::NOTIFICATIONS;

pub const GLOBAL_TOPIC: &str = "/topic/notifications";

pub fn private_topic(identity: &str) -> String {
    format!("/user/{identity}/queue/notifications")
}

/// Global + per-user notification subscriptions, forwarded to one stream.
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
    handles: Vec<SubscriptionHandle>,
}

impl NotificationSink {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx, handles: Vec::new() }
    }

    pub fn is_subscribed(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Subscribe both topics. Needs a known identity; without one nothing is
    /// subscribed (there is no signed-in user to notify).
    pub fn on_connected(&mut self, conn: &mut ConnectionManager, identity: Option<&str>) {
        self.handles.retain(|h| conn.is_active(h));
        if self.is_subscribed() {
            return;
        }
        let Some(identity) = identity else {
            debug!("no identity, notifications not subscribed");
            return;
        };
        let topics = [
            (GLOBAL_TOPIC.to_string(), NotificationScope::Global),
            (private_topic(identity), NotificationScope::Private),
        ];
        for (topic, scope) in topics {
            let tx = self.tx.clone();
            let handler = move |body: NotificationBody| {
                NOTIFICATIONS.with_label_values(&[scope.as_str()]).inc();
                let note = Notification { scope, message: body.message, received_at: Utc::now() };
                if tx.send(note).is_err() {
                    debug!(scope = scope.as_str(), "notification stream closed, message dropped");
                }
            };
            if let Some(h) = conn.subscribe(&topic, handler) {
                self.handles.push(h);
            }
        }
        info!(%identity, topics = self.handles.len(), "notifications subscribed");
    }

    pub fn reset(&mut self) {
        self.handles.clear();
    }

    pub fn unsubscribe_all(&mut self, conn: &mut ConnectionManager) {
        for h in self.handles.drain(..) {
            conn.unsubscribe(h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::connected_manager;
    use crate::stomp::{Command, Frame};

    #[tokio::test(start_paused = true)]
    async fn forwards_both_scopes() {
        let (mut conn, _factory, mut peer) = connected_manager(1000).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = NotificationSink::new(tx);

        sink.on_connected(&mut conn, None);
        assert!(!sink.is_subscribed());

        sink.on_connected(&mut conn, Some("ana@example.com"));
        sink.on_connected(&mut conn, Some("ana@example.com"));
        let subs = peer.drain_frames();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].get("destination"), Some(GLOBAL_TOPIC));
        assert_eq!(subs[1].get("destination"), Some("/user/ana@example.com/queue/notifications"));

        let msg = |sid: &str, body: &str| {
            Frame::new(Command::Message).header("subscription", sid).with_body(body).encode()
        };
        peer.text(msg(subs[0].get("id").unwrap(), r#"{"id":7,"message":"Market closes early","read":false}"#));
        peer.text(msg(subs[1].get("id").unwrap(), r#""{\"message\":\"Order filled\"}""#));
        peer.text(msg(subs[1].get("id").unwrap(), r#"{"text":"Legacy shape"}"#));
        let _ = tokio::time::timeout(std::time::Duration::from_millis(5), conn.drive()).await;

        let a = rx.try_recv().unwrap();
        assert_eq!((a.scope, a.message.as_str()), (NotificationScope::Global, "Market closes early"));
        let b = rx.try_recv().unwrap();
        assert_eq!((b.scope, b.message.as_str()), (NotificationScope::Private, "Order filled"));
        assert_eq!(rx.try_recv().unwrap().message, "Legacy shape");

        sink.unsubscribe_all(&mut conn);
        assert!(conn.active_topics().is_empty());
    }
}
