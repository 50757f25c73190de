// ===============================
// src/connection.rs (STOMP connection manager)
// ===============================
//
// Disconnected --open--> Connecting --CONNECTED--> Connected
//      ^                                              |
//      +------------ error / close / heart-beat ------+
//
// The manager owns the transport link and the subscription table. It is
// driven by `drive().await`, which waits for the next transport event or
// timer, handles it synchronously and reports Connected/Disconnected
// transitions. All state lives in `self`, so dropping a pending `drive()`
// (e.g. inside `select!`) loses nothing.
//
use ahash::AHashMap as HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::ConnectionState;
use crate::error::TransportError;
use crate::metrics::{CHANNEL_CONNECTED, CHANNEL_RECONNECTS, MALFORMED};
use crate::stomp::{decode_all, negotiate_heartbeat, Command, Frame, Inbound, HEARTBEAT};
use crate::token::TokenSource;
use crate::transport::{redact, TransportEvent, TransportFactory, TransportLink};

// Missing this many expected heart-beats in a row drops the connection.
const HEARTBEAT_GRACE: u32 = 2;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub channel_url: Url,
    /// Zero means one immediate retry per disconnect.
    pub reconnect_delay: Duration,
    /// Offered in CONNECT as `heart-beat:<out>,<in>`; zero disables a direction.
    pub heartbeat_out: Duration,
    pub heartbeat_in: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
}

/// Returned by `subscribe`; the only way to unsubscribe. Becomes inert when
/// the connection drops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 { self.id }
    pub fn topic(&self) -> &str { &self.topic }
    fn stomp_id(&self) -> String { format!("sub-{}", self.id) }
}

type Dispatch = Box<dyn FnMut(&str) -> Result<(), serde_json::Error> + Send>;

struct SubEntry {
    topic: String,
    dispatch: Dispatch,
}

pub type ErrorCallback = Box<dyn Fn(&TransportError) + Send + Sync>;

struct Heartbeat {
    send_every: Option<Duration>,
    expect_within: Option<Duration>,
    next_send: Instant,
    last_seen: Instant,
}

impl Heartbeat {
    fn deadline(&self) -> Option<Instant> {
        self.expect_within.map(|d| self.last_seen + d * HEARTBEAT_GRACE)
    }
}

pub struct ConnectionManager {
    cfg: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    tokens: Arc<dyn TokenSource>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    link: Option<TransportLink>,
    subs: HashMap<u64, SubEntry>,
    next_sub_id: u64,
    queued: Vec<String>,
    reconnect_at: Option<Instant>,
    immediate_retry_used: bool,
    heartbeat: Option<Heartbeat>,
    on_error: Option<ErrorCallback>,
    closed: bool,
}

enum Wake {
    Event(Option<TransportEvent>),
    Timer,
}

impl ConnectionManager {
    pub fn new(
        cfg: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            cfg,
            factory,
            tokens,
            state: ConnectionState::Disconnected,
            state_tx,
            link: None,
            subs: HashMap::new(),
            next_sub_id: 0,
            queued: Vec::new(),
            reconnect_at: None,
            immediate_retry_used: false,
            heartbeat: None,
            on_error: None,
            closed: false,
        }
    }

    /// Transport-level failures are reported here, never to subscribers.
    pub fn on_error(&mut self, cb: ErrorCallback) {
        self.on_error = Some(cb);
    }

    pub fn state(&self) -> ConnectionState { self.state }

    pub fn is_connected(&self) -> bool { self.state.is_connected() }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.subs.contains_key(&handle.id)
    }

    pub fn active_topics(&self) -> Vec<String> {
        let mut v: Vec<String> = self.subs.values().map(|s| s.topic.clone()).collect();
        v.sort();
        v
    }

    /// Start connecting. No-op while Connecting or Connected. The credential
    /// is read now and travels as the `token` query parameter.
    pub fn open(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        self.closed = false;
        self.reconnect_at = None;
        self.immediate_retry_used = false;
        self.connect();
    }

    fn connect(&mut self) {
        let url = self.connect_url();
        info!(url = %redact(&url), "opening channel");
        self.link = Some(self.factory.open(&url));
        self.set_state(ConnectionState::Connecting);
    }

    fn connect_url(&self) -> Url {
        let mut url = self.cfg.channel_url.clone();
        if let Some(token) = self.tokens.current() {
            url.query_pairs_mut().append_pair("token", &token);
        }
        url
    }

    /// Register `handler` for every MESSAGE on `topic`, the body decoded as
    /// JSON into `T`. `None` while not connected; retry on the next Connected.
    pub fn subscribe<T, F>(&mut self, topic: &str, mut handler: F) -> Option<SubscriptionHandle>
    where
        T: DeserializeOwned + 'static,
        F: FnMut(T) + Send + 'static,
    {
        if !self.is_connected() {
            warn!(%topic, state = self.state.as_str(), "subscribe while not connected");
            return None;
        }
        let handle = SubscriptionHandle { id: self.next_sub_id, topic: topic.to_string() };
        self.next_sub_id += 1;
        let dispatch: Dispatch = Box::new(move |body: &str| {
            handler(decode_body::<T>(body)?);
            Ok(())
        });
        self.subs.insert(handle.id, SubEntry { topic: handle.topic.clone(), dispatch });
        self.send_raw(Frame::subscribe(&handle.stomp_id(), topic).encode());
        debug!(%topic, id = handle.id, "subscribed");
        Some(handle)
    }

    /// Safe in any state; no-op for an inactive handle.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        if self.subs.remove(&handle.id).is_none() {
            return;
        }
        if self.is_connected() {
            self.send_raw(Frame::unsubscribe(&handle.stomp_id()).encode());
        }
        debug!(topic = %handle.topic, id = handle.id, "unsubscribed");
    }

    /// Send a JSON body to `destination`. Queued while Connecting, dropped
    /// while Disconnected. Returns whether the frame was sent or queued.
    pub fn publish<B: Serialize>(&mut self, destination: &str, body: &B) -> bool {
        let json = match serde_json::to_string(body) {
            Ok(s) => s,
            Err(e) => {
                warn!(?e, %destination, "publish: serialize failed");
                return false;
            }
        };
        let raw = Frame::send(destination, json).encode();
        match self.state {
            ConnectionState::Connected => {
                self.send_raw(raw);
                true
            }
            ConnectionState::Connecting => {
                self.queued.push(raw);
                true
            }
            ConnectionState::Disconnected => {
                warn!(%destination, "publish while disconnected, dropped");
                false
            }
        }
    }

    /// Tear down without reconnecting. Subscriptions become inert.
    pub fn close(&mut self) {
        if self.is_connected() {
            self.send_raw(Frame::new(Command::Disconnect).encode());
        }
        self.closed = true;
        self.reconnect_at = None;
        self.link = None;
        self.subs.clear();
        self.queued.clear();
        self.heartbeat = None;
        if self.state != ConnectionState::Disconnected {
            info!("channel closed");
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Wait for and process the next event; returns on a state transition.
    pub async fn drive(&mut self) -> Transition {
        loop {
            let wake = {
                let deadline = self.next_deadline();
                let inbound = self.link.as_mut().map(|l| &mut l.inbound);
                tokio::select! {
                    ev = recv_opt(inbound) => Wake::Event(ev),
                    _ = sleep_opt(deadline) => Wake::Timer,
                }
            };
            let transition = match wake {
                Wake::Event(Some(ev)) => self.handle_event(ev),
                Wake::Event(None) => self.lose_connection("transport ended"),
                Wake::Timer => self.on_timer(),
            };
            if let Some(t) = transition {
                return t;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut at = self.reconnect_at;
        if let Some(hb) = &self.heartbeat {
            for d in [hb.send_every.map(|_| hb.next_send), hb.deadline()].into_iter().flatten() {
                at = Some(at.map_or(d, |cur| cur.min(d)));
            }
        }
        at
    }

    fn on_timer(&mut self) -> Option<Transition> {
        let now = Instant::now();
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            CHANNEL_RECONNECTS.inc();
            info!("reconnecting channel");
            self.connect();
            return None;
        }
        let (overdue, send_due) = match &self.heartbeat {
            Some(hb) => (
                hb.deadline().filter(|d| *d <= now).map(|_| hb.expect_within.unwrap_or_default()),
                hb.send_every.is_some() && hb.next_send <= now,
            ),
            None => (None, false),
        };
        if let Some(expected) = overdue {
            self.report(TransportError::HeartbeatTimeout(expected.as_millis() as u64));
            return self.lose_connection("heart-beat timeout");
        }
        if send_due {
            self.send_raw(HEARTBEAT.to_string());
            if let Some(hb) = self.heartbeat.as_mut() {
                hb.next_send = now + hb.send_every.unwrap_or_default();
            }
        }
        None
    }

    fn handle_event(&mut self, ev: TransportEvent) -> Option<Transition> {
        match ev {
            TransportEvent::Opened => {
                let host = self.cfg.channel_url.host_str().unwrap_or("localhost").to_string();
                let offer = (self.cfg.heartbeat_out.as_millis() as u64, self.cfg.heartbeat_in.as_millis() as u64);
                self.send_raw(Frame::connect(&host, offer).encode());
                None
            }
            TransportEvent::Text(text) => self.on_text(&text),
            TransportEvent::Error(e) => {
                self.report(e);
                self.lose_connection("transport error")
            }
            TransportEvent::Closed(reason) => {
                if self.state == ConnectionState::Connecting {
                    self.report(TransportError::ClosedDuringHandshake);
                }
                info!(reason = reason.as_deref().unwrap_or(""), "channel closed by peer");
                self.lose_connection("transport closed")
            }
        }
    }

    fn on_text(&mut self, text: &str) -> Option<Transition> {
        if let Some(hb) = self.heartbeat.as_mut() {
            hb.last_seen = Instant::now();
        }
        let mut transition = None;
        for item in decode_all(text) {
            let frame = match item {
                Ok(Inbound::Heartbeat) => continue,
                Ok(Inbound::Frame(f)) => f,
                Err(e) => {
                    MALFORMED.with_label_values(&["frame"]).inc();
                    warn!(?e, "dropping undecodable frame");
                    continue;
                }
            };
            match frame.command {
                Command::Connected => {
                    if self.state == ConnectionState::Connecting {
                        transition = Some(self.on_connected(&frame));
                    }
                }
                Command::Message => self.on_message(&frame),
                Command::Error => {
                    let message = frame.get("message").unwrap_or("broker error").to_string();
                    self.report(TransportError::Broker { message, details: frame.body.clone() });
                    return self.lose_connection("broker error frame");
                }
                Command::Receipt => {}
                other => debug!(command = other.as_str(), "ignoring frame"),
            }
        }
        transition
    }

    fn on_connected(&mut self, frame: &Frame) -> Transition {
        let offer = (self.cfg.heartbeat_out.as_millis() as u64, self.cfg.heartbeat_in.as_millis() as u64);
        let (out_ms, in_ms) = negotiate_heartbeat(offer, frame.get("heart-beat"));
        let now = Instant::now();
        let send_every = (out_ms > 0).then(|| Duration::from_millis(out_ms));
        let expect_within = (in_ms > 0).then(|| Duration::from_millis(in_ms));
        self.heartbeat = (send_every.is_some() || expect_within.is_some()).then(|| Heartbeat {
            send_every,
            expect_within,
            next_send: now + send_every.unwrap_or_default(),
            last_seen: now,
        });
        self.immediate_retry_used = false;
        self.set_state(ConnectionState::Connected);
        info!(version = frame.get("version").unwrap_or("?"), heartbeat_out_ms = out_ms, heartbeat_in_ms = in_ms, "channel connected");
        for raw in std::mem::take(&mut self.queued) {
            self.send_raw(raw);
        }
        Transition::Connected
    }

    fn on_message(&mut self, frame: &Frame) {
        let id = frame
            .get("subscription")
            .and_then(|s| s.strip_prefix("sub-"))
            .and_then(|s| s.parse::<u64>().ok());
        let Some(entry) = id.and_then(|id| self.subs.get_mut(&id)) else {
            debug!(destination = frame.get("destination").unwrap_or(""), "message for inactive subscription");
            return;
        };
        if let Err(e) = (entry.dispatch)(&frame.body) {
            MALFORMED.with_label_values(&["body"]).inc();
            warn!(?e, topic = %entry.topic, "dropping malformed message body");
        }
    }

    fn lose_connection(&mut self, why: &str) -> Option<Transition> {
        self.link = None;
        self.subs.clear();
        self.queued.clear();
        self.heartbeat = None;
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        warn!(reason = why, "channel disconnected");
        self.set_state(ConnectionState::Disconnected);
        if !self.closed {
            self.schedule_reconnect();
        }
        Some(Transition::Disconnected)
    }

    fn schedule_reconnect(&mut self) {
        if self.cfg.reconnect_delay.is_zero() {
            if self.immediate_retry_used {
                warn!("immediate retry already spent, staying disconnected");
                return;
            }
            self.immediate_retry_used = true;
        }
        info!(delay_ms = self.cfg.reconnect_delay.as_millis() as u64, "reconnect scheduled");
        self.reconnect_at = Some(Instant::now() + self.cfg.reconnect_delay);
    }

    fn send_raw(&mut self, raw: String) {
        if let Some(link) = &self.link {
            if link.outbound.send(raw).is_err() {
                debug!("transport gone, frame dropped");
            }
        }
    }

    fn report(&self, e: TransportError) {
        warn!(error = %e, "channel transport error");
        if let Some(cb) = &self.on_error {
            cb(&e);
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        self.state = next;
        CHANNEL_CONNECTED.set(i64::from(next.is_connected()));
        self.state_tx.send_replace(next);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

// Bodies are JSON; some producers double-encode them as a JSON string.
fn decode_body<T: DeserializeOwned>(body: &str) -> Result<T, serde_json::Error> {
    match serde_json::from_str::<T>(body) {
        Ok(v) => Ok(v),
        Err(e) => match serde_json::from_str::<String>(body) {
            Ok(inner) => serde_json::from_str::<T>(&inner),
            Err(_) => Err(e),
        },
    }
}

async fn recv_opt(rx: Option<&mut mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::connected_frame;
    use super::*;
    use crate::domain::PriceEvent;
    use crate::token::StaticTokenSource;
    use crate::transport::testing::{MemoryPeer, MemoryTransportFactory};
    use std::sync::Mutex;
    use tokio::time::timeout;

    fn cfg(reconnect_ms: u64, hb_ms: u64) -> ConnectionConfig {
        ConnectionConfig {
            channel_url: Url::parse("ws://broker.test:8000/ws").unwrap(),
            reconnect_delay: Duration::from_millis(reconnect_ms),
            heartbeat_out: Duration::from_millis(hb_ms),
            heartbeat_in: Duration::from_millis(hb_ms),
        }
    }

    fn manager(cfg: ConnectionConfig, token: Option<&str>) -> (ConnectionManager, MemoryTransportFactory, Arc<StaticTokenSource>) {
        let factory = MemoryTransportFactory::default();
        let tokens = Arc::new(StaticTokenSource::new(token.map(String::from)));
        let mgr = ConnectionManager::new(cfg, Arc::new(factory.clone()), tokens.clone());
        (mgr, factory, tokens)
    }

    fn message(sub: &str, body: &str) -> String {
        Frame::new(Command::Message)
            .header("subscription", sub)
            .header("destination", "/topic/prices/AAPL")
            .header("message-id", "m-1")
            .with_body(body)
            .encode()
    }

    async fn step(mgr: &mut ConnectionManager, ms: u64) -> Option<Transition> {
        timeout(Duration::from_millis(ms), mgr.drive()).await.ok()
    }

    async fn connect(mgr: &mut ConnectionManager, factory: &MemoryTransportFactory, hb: &str) -> MemoryPeer {
        mgr.open();
        let mut peer = factory.take_peer().expect("transport opened");
        peer.emit(TransportEvent::Opened);
        peer.text(connected_frame(hb));
        assert_eq!(step(mgr, 10).await, Some(Transition::Connected));
        let connect = peer.next_frame().expect("CONNECT sent");
        assert_eq!(connect.command, Command::Connect);
        peer
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_idempotent_and_carries_token() {
        let (mut mgr, factory, _) = manager(cfg(1000, 0), Some("tok en"));
        mgr.open();
        mgr.open();
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert_eq!(factory.opened().len(), 1);
        assert_eq!(factory.opened()[0].as_str(), "ws://broker.test:8000/ws?token=tok+en");

        let mut peer = factory.take_peer().unwrap();
        peer.emit(TransportEvent::Opened);
        assert_eq!(step(&mut mgr, 10).await, None);
        let connect = peer.next_frame().unwrap();
        assert_eq!(connect.get("host"), Some("broker.test"));
        assert_eq!(connect.get("heart-beat"), Some("0,0"));

        peer.text(connected_frame("0,0"));
        assert_eq!(step(&mut mgr, 10).await, Some(Transition::Connected));
        assert!(mgr.is_connected());
        assert!(*mgr.watch_state().borrow() == ConnectionState::Connected);
        mgr.open();
        assert_eq!(factory.opened().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_token_means_no_query() {
        let (mut mgr, factory, _) = manager(cfg(1000, 0), None);
        mgr.open();
        assert_eq!(factory.opened()[0].as_str(), "ws://broker.test:8000/ws");
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_requires_connected() {
        let (mut mgr, factory, _) = manager(cfg(1000, 0), None);
        assert!(mgr.subscribe("/topic/prices/AAPL", |_: PriceEvent| {}).is_none());
        mgr.open();
        assert!(mgr.subscribe("/topic/prices/AAPL", |_: PriceEvent| {}).is_none());
        let _peer = connect(&mut mgr, &factory, "0,0").await;
        assert!(mgr.subscribe("/topic/prices/AAPL", |_: PriceEvent| {}).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn messages_reach_handler_and_bad_bodies_are_dropped() {
        let (mut mgr, factory, _) = manager(cfg(1000, 0), None);
        let mut peer = connect(&mut mgr, &factory, "0,0").await;
        let got: Arc<Mutex<Vec<PriceEvent>>> = Arc::default();
        let sink = got.clone();
        let h = mgr
            .subscribe("/topic/prices/AAPL", move |ev: PriceEvent| sink.lock().unwrap().push(ev))
            .unwrap();
        let sub = peer.next_frame().unwrap();
        assert_eq!(sub.command, Command::Subscribe);
        assert_eq!(sub.get("destination"), Some("/topic/prices/AAPL"));
        let sid = sub.get("id").unwrap().to_string();

        peer.text(message(&sid, r#"{"symbol":"AAPL","price":120}"#));
        peer.text(message(&sid, "not json"));
        peer.text(message(&sid, r#""{\"symbol\":\"AAPL\",\"price\":121}""#));
        peer.text(message("sub-999", r#"{"symbol":"AAPL","price":1}"#));
        peer.text("GARBAGE\n\n\0");
        assert_eq!(step(&mut mgr, 10).await, None);

        let prices: Vec<f64> = got.lock().unwrap().iter().map(|e| e.price).collect();
        assert_eq!(prices, vec![120.0, 121.0]);
        assert!(mgr.is_connected());

        mgr.unsubscribe(h.clone());
        assert!(!mgr.is_active(&h));
        let unsub = peer.next_frame().unwrap();
        assert_eq!(unsub.command, Command::Unsubscribe);
        assert_eq!(unsub.get("id"), Some(sid.as_str()));
        mgr.unsubscribe(h);
        assert!(peer.next_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_then_reconnect_with_fresh_token() {
        let (mut mgr, factory, tokens) = manager(cfg(5000, 0), Some("old"));
        let peer = connect(&mut mgr, &factory, "0,0").await;
        let errors: Arc<Mutex<Vec<TransportError>>> = Arc::default();
        let seen = errors.clone();
        mgr.on_error(Box::new(move |e: &TransportError| seen.lock().unwrap().push(e.clone())));
        let h = mgr.subscribe("/topic/prices/AAPL", |_: PriceEvent| {}).unwrap();

        tokens.set(Some("new".into()));
        peer.emit(TransportEvent::Error(TransportError::Socket("reset".into())));
        assert_eq!(step(&mut mgr, 10).await, Some(Transition::Disconnected));
        assert!(!mgr.is_active(&h));
        assert_eq!(errors.lock().unwrap().len(), 1);
        mgr.unsubscribe(h);

        // nothing before the delay elapses
        assert_eq!(step(&mut mgr, 4000).await, None);
        assert_eq!(factory.opened().len(), 1);
        assert_eq!(step(&mut mgr, 1500).await, None);
        assert_eq!(factory.opened().len(), 2);
        assert_eq!(factory.opened()[1].query(), Some("token=new"));
        assert_eq!(mgr.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_retries_at_most_once() {
        let (mut mgr, factory, _) = manager(cfg(0, 0), None);
        mgr.open();
        let first = factory.take_peer().unwrap();
        first.emit(TransportEvent::Error(TransportError::Connect("refused".into())));
        assert_eq!(step(&mut mgr, 10).await, Some(Transition::Disconnected));
        assert_eq!(step(&mut mgr, 10).await, None);
        assert_eq!(factory.opened().len(), 2);

        let second = factory.take_peer().unwrap();
        second.emit(TransportEvent::Closed(None));
        assert_eq!(step(&mut mgr, 10).await, Some(Transition::Disconnected));
        assert_eq!(step(&mut mgr, 60_000).await, None);
        assert_eq!(factory.opened().len(), 2);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_sent_and_silence_drops_connection() {
        let (mut mgr, factory, _) = manager(cfg(60_000, 1000), None);
        let mut peer = connect(&mut mgr, &factory, "1000,1000").await;

        // inbound traffic keeps the connection alive
        assert_eq!(step(&mut mgr, 1500).await, None);
        peer.text("\n");
        assert_eq!(step(&mut mgr, 1000).await, None);
        assert!(mgr.is_connected());
        assert!(peer.from_client.try_recv().is_ok_and(|s| s == "\n"));

        // then silence past the grace window
        assert_eq!(step(&mut mgr, 5000).await, Some(Transition::Disconnected));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_error_frame_disconnects() {
        let (mut mgr, factory, _) = manager(cfg(1000, 0), None);
        let peer = connect(&mut mgr, &factory, "0,0").await;
        let errors: Arc<Mutex<Vec<TransportError>>> = Arc::default();
        let seen = errors.clone();
        mgr.on_error(Box::new(move |e: &TransportError| seen.lock().unwrap().push(e.clone())));
        peer.text(Frame::new(Command::Error).header("message", "bad token").with_body("details").encode());
        assert_eq!(step(&mut mgr, 10).await, Some(Transition::Disconnected));
        assert_eq!(
            errors.lock().unwrap()[0],
            TransportError::Broker { message: "bad token".into(), details: "details".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publish_queues_while_connecting() {
        let (mut mgr, factory, _) = manager(cfg(1000, 0), None);
        assert!(!mgr.publish("/app/ping", &serde_json::json!({"n": 0})));
        mgr.open();
        assert!(mgr.publish("/app/ping", &serde_json::json!({"n": 1})));
        let mut peer = factory.take_peer().unwrap();
        peer.emit(TransportEvent::Opened);
        peer.text(connected_frame("0,0"));
        assert_eq!(step(&mut mgr, 10).await, Some(Transition::Connected));
        let frames = peer.drain_frames();
        assert_eq!(frames[0].command, Command::Connect);
        assert_eq!(frames[1].command, Command::Send);
        assert_eq!(frames[1].body, r#"{"n":1}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_connecting_is_clean() {
        let (mut mgr, factory, _) = manager(cfg(0, 0), None);
        mgr.open();
        let peer = factory.take_peer().unwrap();
        mgr.close();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(mgr.active_topics().is_empty());
        assert!(peer.to_client.is_closed());
        assert_eq!(step(&mut mgr, 10_000).await, None);
        assert_eq!(factory.opened().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_when_connected_sends_disconnect() {
        let (mut mgr, factory, _) = manager(cfg(1000, 0), None);
        let mut peer = connect(&mut mgr, &factory, "0,0").await;
        let h = mgr.subscribe("/topic/prices/AAPL", |_: PriceEvent| {}).unwrap();
        let _ = peer.next_frame();
        mgr.close();
        assert!(!mgr.is_active(&h));
        assert_eq!(peer.next_frame().map(|f| f.command), Some(Command::Disconnect));
        mgr.unsubscribe(h);
        assert_eq!(step(&mut mgr, 10_000).await, None);
        assert_eq!(factory.opened().len(), 1);
    }
}
