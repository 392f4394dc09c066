//! Link manager.
//!
//! Every instance gets up to two persistent asynchronous links: a command
//! link (all kinds) and a pub/sub link (primaries and replicas, subscribed
//! to the hello channel). Replies arrive in send order, so each link keeps
//! a FIFO of the operation kinds awaiting a reply; the reader task pops one
//! per incoming frame and forwards it to the reply dispatcher.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::resp::{self, ParseError, RespValue};

use super::addr::InstanceAddr;
use super::state::{mstime, InstanceCore, InstanceRef, SupervisorState};
use super::{CONNECT_TIMEOUT_MS, HELLO_CHANNEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Command,
    PubSub,
}

/// Kind of an outstanding request, used to route its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Ping,
    Info,
    HelloPublish,
    Auth,
    ScriptKill,
    ReplicaOf,
    ConfigRewrite,
    IsPrimaryDown,
    Subscribe,
}

/// Events produced by link tasks, drained serially by the dispatcher.
#[derive(Debug)]
pub enum LinkEvent {
    Reply {
        iref: InstanceRef,
        op: OpKind,
        frame: RespValue,
    },
    PubSubMessage {
        iref: InstanceRef,
        channel: Bytes,
        payload: Bytes,
    },
    Closed {
        iref: InstanceRef,
        link: LinkType,
    },
}

/// One live connection to an instance.
#[derive(Debug)]
pub struct Link {
    tx: mpsc::UnboundedSender<(OpKind, Bytes)>,
    pending_ops: Arc<Mutex<VecDeque<OpKind>>>,
    alive: Arc<AtomicBool>,
}

impl Link {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn has_pending(&self, op: OpKind) -> bool {
        self.pending_ops.lock().contains(&op)
    }

    fn send(&self, op: OpKind, frame: &RespValue) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.tx.send((op, frame.serialize())).is_ok()
    }
}

/// Link slots and timers embedded in every instance.
#[derive(Debug)]
pub struct Links {
    pub cmd: Mutex<Option<Link>>,
    pub pubsub: Mutex<Option<Link>>,
    cmd_connecting: AtomicBool,
    pubsub_connecting: AtomicBool,
    pub cmd_conn_time: AtomicU64,
    pub pubsub_conn_time: AtomicU64,
    pub pubsub_last_activity: AtomicU64,
    pub pending_commands: AtomicU32,
}

impl Links {
    pub fn new() -> Self {
        Self {
            cmd: Mutex::new(None),
            pubsub: Mutex::new(None),
            cmd_connecting: AtomicBool::new(false),
            pubsub_connecting: AtomicBool::new(false),
            cmd_conn_time: AtomicU64::new(0),
            pubsub_conn_time: AtomicU64::new(0),
            pubsub_last_activity: AtomicU64::new(0),
            pending_commands: AtomicU32::new(0),
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending_commands.load(Ordering::Relaxed)
    }

    fn dec_pending(&self) {
        let _ = self
            .pending_commands
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

impl Default for Links {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue a command on the instance's command link. Returns false when the
/// link is absent or already torn down; the caller retries next tick.
pub fn send_command(core: &InstanceCore, op: OpKind, frame: &RespValue) -> bool {
    let guard = core.links.cmd.lock();
    match guard.as_ref() {
        Some(link) if link.send(op, frame) => {
            core.links.pending_commands.fetch_add(1, Ordering::Relaxed);
            true
        }
        _ => false,
    }
}

/// True when a request of this kind is already in flight on the command link.
pub fn has_pending(core: &InstanceCore, op: OpKind) -> bool {
    core.links
        .cmd
        .lock()
        .as_ref()
        .map(|link| link.has_pending(op))
        .unwrap_or(false)
}

/// Send SLAVEOF (or SLAVEOF NO ONE when `target` is None), followed by a
/// best-effort CONFIG REWRITE so the instance persists its new role.
pub fn send_replica_of(core: &InstanceCore, target: Option<InstanceAddr>) -> bool {
    let frame = match target {
        Some(addr) => {
            RespValue::command(&["SLAVEOF", &addr.ip_string(), &addr.port.to_string()])
        }
        None => RespValue::command(&["SLAVEOF", "NO", "ONE"]),
    };
    if !send_command(core, OpKind::ReplicaOf, &frame) {
        return false;
    }
    send_command(
        core,
        OpKind::ConfigRewrite,
        &RespValue::command(&["CONFIG", "REWRITE"]),
    );
    true
}

/// Tear down one link. The instance is marked DISCONNECTED and the next
/// tick reconnects.
pub fn kill_link(core: &InstanceCore, which: LinkType) {
    let taken = match which {
        LinkType::Command => core.links.cmd.lock().take(),
        LinkType::PubSub => core.links.pubsub.lock().take(),
    };
    if let Some(link) = taken {
        link.alive.store(false, Ordering::Relaxed);
    }
    if which == LinkType::Command {
        core.links.pending_commands.store(0, Ordering::Relaxed);
    }
    core.flags.set_disconnected(true);
}

/// Clear DISCONNECTED once every required link is established: the command
/// link for all kinds, plus the pub/sub link for primaries and replicas.
pub fn maybe_clear_disconnected(core: &InstanceCore) {
    let cmd_up = core
        .links
        .cmd
        .lock()
        .as_ref()
        .map(|l| l.is_alive())
        .unwrap_or(false);
    if !cmd_up {
        return;
    }
    if core.flags.is_peer() {
        core.flags.set_disconnected(false);
        return;
    }
    let pubsub_up = core
        .links
        .pubsub
        .lock()
        .as_ref()
        .map(|l| l.is_alive())
        .unwrap_or(false);
    if pubsub_up {
        core.flags.set_disconnected(false);
    }
}

/// Open the missing links of a disconnected instance. Connection attempts
/// run in their own tasks so the tick is never blocked on a dial.
pub fn reconnect_instance(state: &Arc<SupervisorState>, iref: &InstanceRef) {
    let core = iref.core();
    if !core.flags.is_disconnected() {
        return;
    }

    let needs_cmd = core.links.cmd.lock().is_none();
    if needs_cmd
        && core
            .links
            .cmd_connecting
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        spawn_connect(state.clone(), iref.clone(), LinkType::Command);
    }

    if !iref.core().flags.is_peer() {
        let needs_pubsub = core.links.pubsub.lock().is_none();
        if needs_pubsub
            && core
                .links
                .pubsub_connecting
                .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            spawn_connect(state.clone(), iref.clone(), LinkType::PubSub);
        }
    }

    maybe_clear_disconnected(core);
}

fn spawn_connect(state: Arc<SupervisorState>, iref: InstanceRef, which: LinkType) {
    tokio::spawn(async move {
        let addr = iref.core().addr();
        let dial = timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            TcpStream::connect((addr.ip, addr.port)),
        )
        .await;

        match dial {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                install_link(&state, &iref, which, stream);
            }
            _ => {
                log::debug!(
                    "Failed to connect {} link to {} {}",
                    link_type_str(which),
                    iref.type_str(),
                    addr
                );
            }
        }

        let core = iref.core();
        match which {
            LinkType::Command => core.links.cmd_connecting.store(false, Ordering::Relaxed),
            LinkType::PubSub => core.links.pubsub_connecting.store(false, Ordering::Relaxed),
        }
    });
}

fn link_type_str(which: LinkType) -> &'static str {
    match which {
        LinkType::Command => "cmd",
        LinkType::PubSub => "pubsub",
    }
}

fn install_link(state: &Arc<SupervisorState>, iref: &InstanceRef, which: LinkType, stream: TcpStream) {
    let core = iref.core();
    let now = mstime();

    let (tx, rx) = mpsc::unbounded_channel();
    let pending_ops = Arc::new(Mutex::new(VecDeque::new()));
    let alive = Arc::new(AtomicBool::new(true));

    let link = Link {
        tx,
        pending_ops: pending_ops.clone(),
        alive: alive.clone(),
    };

    // Authenticate with the primary-scoped secret before anything else.
    if let Some(pass) = iref.primary().auth_pass() {
        if link.send(OpKind::Auth, &RespValue::command(&["AUTH", &pass])) {
            core.links.pending_commands.fetch_add(1, Ordering::Relaxed);
        }
    }

    if which == LinkType::PubSub {
        // A pub/sub link that cannot subscribe is useless; if the send
        // fails the io task ends and the next tick rebuilds the link.
        link.send(
            OpKind::Subscribe,
            &RespValue::command(&["SUBSCRIBE", HELLO_CHANNEL]),
        );
    }

    match which {
        LinkType::Command => {
            core.links.cmd_conn_time.store(now, Ordering::Relaxed);
            *core.links.cmd.lock() = Some(link);
        }
        LinkType::PubSub => {
            core.links.pubsub_conn_time.store(now, Ordering::Relaxed);
            core.links.pubsub_last_activity.store(now, Ordering::Relaxed);
            *core.links.pubsub.lock() = Some(link);
        }
    }

    tokio::spawn(run_link_io(
        state.clone(),
        iref.clone(),
        which,
        stream,
        rx,
        pending_ops,
        alive,
    ));

    maybe_clear_disconnected(core);
}

/// Single task owning the socket: writes queued commands, reads reply
/// frames, and forwards them to the dispatcher.
async fn run_link_io(
    state: Arc<SupervisorState>,
    iref: InstanceRef,
    which: LinkType,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<(OpKind, Bytes)>,
    pending_ops: Arc<Mutex<VecDeque<OpKind>>>,
    alive: Arc<AtomicBool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(16 * 1024);

    'io: loop {
        if !alive.load(Ordering::Relaxed) {
            break;
        }
        tokio::select! {
            queued = rx.recv() => {
                match queued {
                    Some((op, bytes)) => {
                        pending_ops.lock().push_back(op);
                        if writer.write_all(&bytes).await.is_err() {
                            break 'io;
                        }
                    }
                    // Link handle dropped: the link was killed.
                    None => break 'io,
                }
            }
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break 'io,
                    Ok(_) => loop {
                        match resp::parse_value(&buf) {
                            Ok((frame, consumed)) => {
                                let _ = buf.split_to(consumed);
                                handle_frame(&state, &iref, which, &pending_ops, frame);
                            }
                            Err(ParseError::Incomplete) => break,
                            Err(_) => break 'io,
                        }
                    },
                }
            }
        }
    }

    if alive.swap(false, Ordering::Relaxed) {
        let _ = state.link_events.send(LinkEvent::Closed {
            iref,
            link: which,
        });
    }
}

fn handle_frame(
    state: &Arc<SupervisorState>,
    iref: &InstanceRef,
    which: LinkType,
    pending_ops: &Arc<Mutex<VecDeque<OpKind>>>,
    frame: RespValue,
) {
    let core = iref.core();

    if which == LinkType::PubSub {
        // Any traffic counts as channel activity, our own hellos included.
        core.links
            .pubsub_last_activity
            .store(mstime(), Ordering::Relaxed);

        if let Some((channel, payload)) = as_message_push(&frame) {
            let _ = state.link_events.send(LinkEvent::PubSubMessage {
                iref: iref.clone(),
                channel,
                payload,
            });
            return;
        }
    }

    let op = pending_ops.lock().pop_front();
    let Some(op) = op else {
        // Unsolicited frame; nothing waits for it.
        return;
    };
    if op != OpKind::Subscribe {
        core.links.dec_pending();
    }

    let _ = state.link_events.send(LinkEvent::Reply {
        iref: iref.clone(),
        op,
        frame,
    });
}

/// `["message", channel, payload]` pushes from the hello subscription.
fn as_message_push(frame: &RespValue) -> Option<(Bytes, Bytes)> {
    let RespValue::Array(items) = frame else {
        return None;
    };
    if items.len() != 3 {
        return None;
    }
    let kind = items[0].as_bytes()?;
    if !kind.eq_ignore_ascii_case(b"message") {
        return None;
    }
    Some((items[1].as_bytes()?.clone(), items[2].as_bytes()?.clone()))
}

/// Attach an in-memory command link so unit tests can observe sends.
#[cfg(test)]
pub(crate) fn attach_test_cmd_link(
    core: &super::state::InstanceCore,
) -> mpsc::UnboundedReceiver<(OpKind, Bytes)> {
    let (tx, rx) = mpsc::unbounded_channel();
    *core.links.cmd.lock() = Some(Link {
        tx,
        pending_ops: Arc::new(Mutex::new(VecDeque::new())),
        alive: Arc::new(AtomicBool::new(true)),
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state::test_util::*;

    fn dummy_link() -> (Link, mpsc::UnboundedReceiver<(OpKind, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Link {
                tx,
                pending_ops: Arc::new(Mutex::new(VecDeque::new())),
                alive: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    #[test]
    fn test_send_command_counts_pending() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let (link, _rx) = dummy_link();
        *primary.core.links.cmd.lock() = Some(link);

        assert!(send_command(
            &primary.core,
            OpKind::Ping,
            &RespValue::command(&["PING"])
        ));
        assert_eq!(primary.core.links.pending(), 1);
    }

    #[test]
    fn test_kill_link_resets_pending_and_disconnects() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let (link, _rx) = dummy_link();
        *primary.core.links.cmd.lock() = Some(link);
        primary.core.flags.set_disconnected(false);
        send_command(&primary.core, OpKind::Ping, &RespValue::command(&["PING"]));

        kill_link(&primary.core, LinkType::Command);
        assert_eq!(primary.core.links.pending(), 0);
        assert!(primary.core.flags.is_disconnected());
        assert!(primary.core.links.cmd.lock().is_none());
    }

    #[test]
    fn test_disconnected_requires_pubsub_for_replicas() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let replica = test_replica(&primary, "10.0.0.2", 6379);

        let (cmd, _rx1) = dummy_link();
        *replica.core.links.cmd.lock() = Some(cmd);
        maybe_clear_disconnected(&replica.core);
        assert!(replica.core.flags.is_disconnected());

        let (pubsub, _rx2) = dummy_link();
        *replica.core.links.pubsub.lock() = Some(pubsub);
        maybe_clear_disconnected(&replica.core);
        assert!(!replica.core.flags.is_disconnected());
    }

    #[test]
    fn test_peer_needs_only_command_link() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let peer = test_peer(&primary, "10.0.0.5", 26379, "aaaa");

        let (cmd, _rx) = dummy_link();
        *peer.core.links.cmd.lock() = Some(cmd);
        maybe_clear_disconnected(&peer.core);
        assert!(!peer.core.flags.is_disconnected());
    }

    #[test]
    fn test_message_push_detection() {
        let push = RespValue::Array(vec![
            RespValue::bulk("message"),
            RespValue::bulk(HELLO_CHANNEL),
            RespValue::bulk("payload"),
        ]);
        assert!(as_message_push(&push).is_some());

        let confirm = RespValue::Array(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk(HELLO_CHANNEL),
            RespValue::Integer(1),
        ]);
        assert!(as_message_push(&confirm).is_none());
    }
}
