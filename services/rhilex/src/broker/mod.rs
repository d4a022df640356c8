//! Lightweight in-process MQTT 3.1.1 broker
//!
//! Used as a local ingress (`GENERIC_MQTT_SERVER` source) and by the
//! `mqtt_server` plugin. Sessions are not persisted, retained messages are
//! not kept and every delivery is QoS 0; inbound QoS 1/2 publishes are
//! acknowledged so clients do not stall.
//!
//! Every connect, publish, subscribe and disconnect is reported through an
//! optional [`EventHook`] as an [`MqttEvent`].

mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use errors::RhilexResult;
use parking_lot::Mutex;
use rumqttc::mqttbytes::v4::Publish;
use rumqttc::mqttbytes::QoS;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `(client_id, username, password) -> allowed`
pub type AuthHook = Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;

pub type EventHook = Arc<dyn Fn(MqttEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub anonymous: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_name: "rhilex-mqtt-server".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1883,
            anonymous: true,
        }
    }
}

/// Normalised client activity record handed to the rule engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttEvent {
    pub action: String,
    pub clientid: String,
    pub username: String,
    pub ipaddress: String,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
}

impl MqttEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Row returned by the `clients` service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub remote: String,
    pub username: String,
    pub clean_session: bool,
    pub listener: String,
    pub topics: Vec<String>,
}

/// One connected client
pub(crate) struct Session {
    conn_id: u64,
    client_id: String,
    username: String,
    remote: SocketAddr,
    clean_session: bool,
    topics: Mutex<Vec<String>>,
    outbound: mpsc::Sender<Publish>,
    kick: CancellationToken,
}

impl Session {
    fn subscribed_to(&self, topic: &str) -> bool {
        self.topics.lock().iter().any(|f| topic_matches(f, topic))
    }
}

pub struct Broker {
    config: BrokerConfig,
    auth: Option<AuthHook>,
    events: Option<EventHook>,
    clients: DashMap<String, Arc<Session>>,
    next_conn: AtomicU64,
    token: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            auth: None,
            events: None,
            clients: DashMap::new(),
            next_conn: AtomicU64::new(1),
            token: CancellationToken::new(),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
        }
    }

    /// Credential check used when anonymous connects are disabled
    pub fn with_auth(mut self, hook: AuthHook) -> Self {
        self.auth = Some(hook);
        self
    }

    pub fn with_events(mut self, hook: EventHook) -> Self {
        self.events = Some(hook);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the listener and start accepting; returns the bound address
    pub async fn start(self: &Arc<Self>) -> RhilexResult<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("MqttServer {} start at [{}] successfully", self.config.server_name, addr);

        let broker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = broker.token.cancelled() => break,
                    a = listener.accept() => a,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(session::serve(Arc::clone(&broker), stream, peer));
                    },
                    Err(e) => warn!("MqttServer accept failed: {}", e),
                }
            }
        });
        if let Some(old) = self.acceptor.lock().replace(handle) {
            old.abort();
        }
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.acceptor.lock().is_some() && !self.token.is_cancelled()
    }

    /// Close the listener and every client connection
    pub fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
        }
        self.clients.clear();
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut list: Vec<ClientInfo> = self
            .clients
            .iter()
            .map(|s| ClientInfo {
                id: s.client_id.clone(),
                remote: s.remote.to_string(),
                username: s.username.clone(),
                clean_session: s.clean_session,
                listener: self.config.server_name.clone(),
                topics: s.topics.lock().clone(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Disconnect `client_id`; false when it is not connected
    pub fn kickout(&self, client_id: &str) -> bool {
        match self.clients.remove(client_id) {
            Some((_, session)) => {
                session.kick.cancel();
                info!("MqttServer kicked out client {}", client_id);
                true
            },
            None => false,
        }
    }

    /// Deliver to every matching subscriber; returns the number reached
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let message = Publish::new(topic, QoS::AtMostOnce, payload.into());
        self.route(&message)
    }

    fn route(&self, message: &Publish) -> usize {
        let mut delivered = 0;
        for session in self.clients.iter() {
            if !session.subscribed_to(&message.topic) {
                continue;
            }
            let mut copy = message.clone();
            copy.qos = QoS::AtMostOnce;
            copy.pkid = 0;
            copy.dup = false;
            match session.outbound.try_send(copy) {
                Ok(()) => delivered += 1,
                Err(_) => debug!("Client {} lagging, message dropped", session.client_id),
            }
        }
        delivered
    }

    fn authenticate(&self, client_id: &str, username: &str, password: &str) -> bool {
        if self.config.anonymous {
            return true;
        }
        self.auth
            .as_ref()
            .is_some_and(|check| check(client_id, username, password))
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session, kicking an older connection with the same id
    fn attach(&self, session: Arc<Session>) {
        if let Some(old) = self.clients.insert(session.client_id.clone(), session) {
            old.kick.cancel();
        }
    }

    fn detach(&self, session: &Session) {
        self.clients
            .remove_if(&session.client_id, |_, s| s.conn_id == session.conn_id);
    }

    fn emit(&self, session: &Session, action: &str, topic: &str, payload: &[u8]) {
        let Some(hook) = &self.events else { return };
        hook(MqttEvent {
            action: action.to_string(),
            clientid: session.client_id.clone(),
            username: session.username.clone(),
            ipaddress: session.remote.to_string(),
            ts: common::time::now_ms(),
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// MQTT topic filter match with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            },
            exact => {
                if levels.next() != Some(exact) {
                    return false;
                }
            },
        }
    }
    levels.next().is_none()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_filters() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("#", "a"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b/c/d", "a/b/c"));
        assert!(!topic_matches("#", "$SYS/uptime"));
    }

    #[test]
    fn test_event_json_omits_empty_topic() {
        let event = MqttEvent {
            action: "connect".into(),
            clientid: "c1".into(),
            username: "".into(),
            ipaddress: "127.0.0.1:5000".into(),
            ts: 1,
            topic: String::new(),
            payload: String::new(),
        };
        let json = event.to_json();
        assert!(json.contains("\"action\":\"connect\""));
        assert!(!json.contains("topic"));
    }

    #[test]
    fn test_anonymous_and_hooked_auth() {
        let open = Broker::new(BrokerConfig::default());
        assert!(open.authenticate("c", "", ""));

        let closed = Broker::new(BrokerConfig {
            anonymous: false,
            ..BrokerConfig::default()
        });
        assert!(!closed.authenticate("c", "u", "p"));

        let hooked = Broker::new(BrokerConfig {
            anonymous: false,
            ..BrokerConfig::default()
        })
        .with_auth(Arc::new(|_, user, pass| user == "admin" && pass == "secret"));
        assert!(hooked.authenticate("c", "admin", "secret"));
        assert!(!hooked.authenticate("c", "admin", "nope"));
    }
}
