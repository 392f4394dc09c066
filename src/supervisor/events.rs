//! Event emission.
//!
//! Every significant state transition emits a `<+|->type` event: logged,
//! broadcast to pub/sub subscribers of the listening port, and, for
//! warning-level events bound to a primary, turned into a notification
//! script run.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::state::{PeerInstance, PrimaryInstance, ReplicaInstance, SupervisorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Debug,
    Notice,
    Warning,
}

/// An event as delivered to pub/sub subscribers: channel is the event
/// type, message the instance description.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub channel: String,
    pub message: String,
}

#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PublishedEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, channel: &str, message: &str) {
        let _ = self.tx.send(PublishedEvent {
            channel: channel.to_string(),
            message: message.to_string(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit an event. `notify` names the primary whose notification script
/// should run for warning-level events.
pub fn emit(
    state: &SupervisorState,
    level: EventLevel,
    kind: &str,
    body: &str,
    notify: Option<&Arc<PrimaryInstance>>,
) {
    match level {
        EventLevel::Debug => log::debug!("{} {}", kind, body),
        EventLevel::Notice => log::info!("{} {}", kind, body),
        EventLevel::Warning => log::warn!("{} {}", kind, body),
    }

    if level != EventLevel::Debug {
        state.events.publish(kind, body);
    }

    if level == EventLevel::Warning {
        if let Some(primary) = notify {
            let script = primary.config.read().notification_script.clone();
            if let Some(path) = script {
                state.scripts.schedule(vec![
                    path.to_string_lossy().into_owned(),
                    kind.to_string(),
                    body.to_string(),
                ]);
            }
        }
    }
}

/// `master <name> <ip> <port>`
pub fn primary_body(primary: &PrimaryInstance) -> String {
    let addr = primary.core.addr();
    format!(
        "master {} {} {}",
        primary.core.name,
        addr.ip_string(),
        addr.port
    )
}

/// `slave <name> <ip> <port> @ <primary> <ip> <port>`
pub fn replica_body(replica: &ReplicaInstance, primary: &PrimaryInstance) -> String {
    let addr = replica.core.addr();
    let paddr = primary.core.addr();
    format!(
        "slave {} {} {} @ {} {} {}",
        replica.core.name,
        addr.ip_string(),
        addr.port,
        primary.core.name,
        paddr.ip_string(),
        paddr.port
    )
}

/// `sentinel <name> <ip> <port> @ <primary> <ip> <port>`
pub fn peer_body(peer: &PeerInstance, primary: &PrimaryInstance) -> String {
    let addr = peer.core.addr();
    let paddr = primary.core.addr();
    format!(
        "sentinel {} {} {} @ {} {} {}",
        peer.core.name,
        addr.ip_string(),
        addr.port,
        primary.core.name,
        paddr.ip_string(),
        paddr.port
    )
}
