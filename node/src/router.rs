//! Mesh message router (C1): dual-role server+client dispatch on a single
//! opaque-message bus, with self-echo suppression and send serialization.
//!
//! The BLE Mesh callback context only ever enqueues [`MeshEvent`]s; all
//! mutation of the in-flight register, `KnownNode` map and `discovery_complete`
//! flag happens on the worker that drains the channel (spec §5: callbacks
//! capture inputs and hand off, never touch router state directly).

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::time::{Duration, Instant};

use dcmesh_common::MeshAddr;

use crate::executor::Executor;

/// TTL used for every outbound mesh send (spec §4.1: "matches default hops").
pub const SEND_TTL: u8 = 7;

/// Bound on how long `send_command` will block waiting for a busy in-flight
/// slot to clear, matching the transport's own request-expiry timeout.
pub const BUSY_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Cmd,
    Reply,
}

/// Events the BLE Mesh callback hands to the router worker. Never constructed
/// or matched on the callback context itself.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Recv {
        opcode: Opcode,
        src: MeshAddr,
        dst: MeshAddr,
        payload: Vec<u8>,
    },
    SendComplete {
        ok: bool,
    },
    Reply {
        src: MeshAddr,
        payload: Vec<u8>,
    },
    Timeout {
        target: MeshAddr,
    },
}

/// The abstract "addressed opaque-message bus" (spec §4.1). `EspBleMeshBus`
/// (ble_mesh.rs) is the concrete implementation backed by ESP-IDF's BLE Mesh
/// component; router logic here is generic over it so the state machine can
/// be exercised without hardware in tests.
pub trait MeshBus {
    fn send(&self, dst: MeshAddr, opcode: Opcode, payload: &[u8], ttl: u8) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Idle,
    Busy { target: MeshAddr, start: Instant },
}

/// Observed peer unicast addresses with a last-seen timestamp. Populated only
/// by the arrival of a reply; never by scans (spec §3).
#[derive(Default)]
pub struct KnownNodes {
    seen: HashMap<u16, Instant>,
}

impl KnownNodes {
    pub fn observe(&mut self, addr: MeshAddr) {
        self.seen.insert(addr.0, Instant::now());
    }

    pub fn contains(&self, addr: MeshAddr) -> bool {
        self.seen.contains_key(&addr.0)
    }

    pub fn highest_known_id(&self) -> Option<u16> {
        self.seen.keys().copied().max()
    }
}

/// Owns the in-flight register, `KnownNode` map and `discovery_complete` flag.
/// A single instance lives on the worker; never shared with the callback
/// context except through the `MeshEvent` channel.
pub struct Router<B: MeshBus> {
    bus: B,
    self_addr: MeshAddr,
    in_flight: InFlight,
    known: KnownNodes,
    discovery_complete: bool,
    events: Receiver<MeshEvent>,
}

/// Outcome of feeding one `MeshEvent` to the router: either nothing
/// user-visible happened, or a reply payload became available for the
/// upstream consumer (C3 on the attached node).
pub enum RouterOutcome {
    None,
    ReplyForUpstream(Vec<u8>),
}

impl<B: MeshBus> Router<B> {
    pub fn new(bus: B, self_addr: MeshAddr, events: Receiver<MeshEvent>) -> Self {
        Self {
            bus,
            self_addr,
            in_flight: InFlight::Idle,
            known: KnownNodes::default(),
            discovery_complete: false,
            events,
        }
    }

    pub fn known_nodes(&self) -> &KnownNodes {
        &self.known
    }

    pub fn discovery_complete(&self) -> bool {
        self.discovery_complete
    }

    /// Client role: dispatch a command payload toward `target`. Blocks the
    /// caller (the worker loop) up to [`BUSY_WAIT_TIMEOUT`] if a unicast send
    /// is already in flight; group sends never set `busy` and never block
    /// (spec §4.1).
    pub fn send_command(&mut self, target: MeshAddr, payload: &[u8]) -> anyhow::Result<()> {
        if !target.is_group() {
            self.wait_for_idle();
            self.in_flight = InFlight::Busy {
                target,
                start: Instant::now(),
            };
        }
        self.bus.send(target, Opcode::Cmd, payload, SEND_TTL)
    }

    fn wait_for_idle(&mut self) {
        let waited_since = Instant::now();
        while let InFlight::Busy { start, .. } = self.in_flight {
            if waited_since.elapsed() > BUSY_WAIT_TIMEOUT {
                warn!(
                    "in-flight slot held for {:?}, forcing idle",
                    start.elapsed()
                );
                self.in_flight = InFlight::Idle;
                break;
            }
            if let Ok(event) = self.events.recv_timeout(Duration::from_millis(50)) {
                self.apply_event(event, None);
            }
        }
    }

    /// Drain and apply every event currently queued, executing local commands
    /// on `executor` as the server role requires. Returns the last reply
    /// intended for the upstream consumer, if any arrived.
    pub fn drain(&mut self, executor: &mut Executor) -> RouterOutcome {
        let mut outcome = RouterOutcome::None;
        while let Ok(event) = self.events.try_recv() {
            if let RouterOutcome::ReplyForUpstream(payload) = self.apply_event(event, Some(executor))
            {
                outcome = RouterOutcome::ReplyForUpstream(payload);
            }
        }
        outcome
    }

    fn apply_event(&mut self, event: MeshEvent, executor: Option<&mut Executor>) -> RouterOutcome {
        match event {
            MeshEvent::Recv {
                opcode: Opcode::Cmd,
                src,
                dst,
                payload,
            } => self.on_recv_cmd(src, dst, payload, executor),
            MeshEvent::Recv { .. } => RouterOutcome::None,
            MeshEvent::SendComplete { ok: false } => {
                self.in_flight = InFlight::Idle;
                RouterOutcome::None
            }
            MeshEvent::SendComplete { ok: true } => {
                // The message has left the local radio, not reached the peer;
                // clearing busy here would let a second send collide on a
                // relay path (spec §4.1).
                RouterOutcome::None
            }
            MeshEvent::Reply { src, payload } => self.on_reply(src, payload),
            MeshEvent::Timeout { target } => self.on_timeout(target),
        }
    }

    fn on_recv_cmd(
        &mut self,
        src: MeshAddr,
        dst: MeshAddr,
        payload: Vec<u8>,
        executor: Option<&mut Executor>,
    ) -> RouterOutcome {
        if src == self.self_addr {
            // Self-echo of a group message this node issued. Non-optional:
            // without this guard an ALL:READ issuer would double-reply to its
            // own broadcast (spec §4.1).
            return RouterOutcome::None;
        }

        let Some(executor) = executor else {
            return RouterOutcome::None;
        };

        let reply = executor.execute_raw(&payload);
        let reply_src = self.self_addr;
        if let Err(err) = self.bus.send(src, Opcode::Reply, reply.as_bytes(), SEND_TTL) {
            warn!("reply send to {:?} (as {:?}) failed: {err}", src, reply_src);
        }
        RouterOutcome::None
    }

    fn on_reply(&mut self, src: MeshAddr, payload: Vec<u8>) -> RouterOutcome {
        let should_clear = match self.in_flight {
            InFlight::Busy { target, .. } => target == src || target.0 == 0,
            InFlight::Idle => false,
        };
        if should_clear {
            self.in_flight = InFlight::Idle;
        }
        self.known.observe(src);
        RouterOutcome::ReplyForUpstream(payload)
    }

    fn on_timeout(&mut self, target: MeshAddr) -> RouterOutcome {
        self.in_flight = InFlight::Idle;
        if let Some(highest) = self.known.highest_known_id() {
            if target.node_id().map(|id| id > highest).unwrap_or(false) {
                self.discovery_complete = true;
            }
        }
        RouterOutcome::None
    }
}

/// Handle for the callback side: the only thing a BLE Mesh callback is
/// allowed to do is push an event and return.
pub type MeshEventSender = Sender<MeshEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingBus {
        sent: Arc<Mutex<Vec<(MeshAddr, Opcode, Vec<u8>, u8)>>>,
    }

    impl MeshBus for RecordingBus {
        fn send(&self, dst: MeshAddr, opcode: Opcode, payload: &[u8], ttl: u8) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((dst, opcode, payload.to_vec(), ttl));
            Ok(())
        }
    }

    fn router_with_bus() -> (Router<RecordingBus>, Arc<Mutex<Vec<(MeshAddr, Opcode, Vec<u8>, u8)>>>, MeshEventSender) {
        let bus = RecordingBus::default();
        let sent = bus.sent.clone();
        let (tx, rx) = mpsc::channel();
        let router = Router::new(bus, MeshAddr(0x0005), rx);
        (router, sent, tx)
    }

    #[test]
    fn self_echo_is_dropped() {
        let (mut router, sent, tx) = router_with_bus();
        let mut executor = Executor::new_for_test();
        tx.send(MeshEvent::Recv {
            opcode: Opcode::Cmd,
            src: MeshAddr(0x0005),
            dst: MeshAddr::GROUP,
            payload: b"ALL:READ".to_vec(),
        })
        .unwrap();
        router.drain(&mut executor);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn reply_clears_busy_and_tracks_known_node() {
        let (mut router, _sent, tx) = router_with_bus();
        let mut executor = Executor::new_for_test();
        router.in_flight = InFlight::Busy {
            target: MeshAddr(0x0008),
            start: Instant::now(),
        };
        tx.send(MeshEvent::Reply {
            src: MeshAddr(0x0008),
            payload: b"NODE3:DATA:D:0%,V:0.000V,I:0.00mA,P:0.0mW".to_vec(),
        })
        .unwrap();
        router.drain(&mut executor);
        assert_eq!(router.in_flight, InFlight::Idle);
        assert!(router.known_nodes().contains(MeshAddr(0x0008)));
    }

    #[test]
    fn send_complete_ok_does_not_clear_busy() {
        let (mut router, _sent, tx) = router_with_bus();
        let mut executor = Executor::new_for_test();
        router.in_flight = InFlight::Busy {
            target: MeshAddr(0x0008),
            start: Instant::now(),
        };
        tx.send(MeshEvent::SendComplete { ok: true }).unwrap();
        router.drain(&mut executor);
        assert!(matches!(router.in_flight, InFlight::Busy { .. }));
    }

    #[test]
    fn send_complete_err_clears_busy() {
        let (mut router, _sent, tx) = router_with_bus();
        let mut executor = Executor::new_for_test();
        router.in_flight = InFlight::Busy {
            target: MeshAddr(0x0008),
            start: Instant::now(),
        };
        tx.send(MeshEvent::SendComplete { ok: false }).unwrap();
        router.drain(&mut executor);
        assert_eq!(router.in_flight, InFlight::Idle);
    }

    #[test]
    fn group_send_does_not_set_busy() {
        let (mut router, _sent, _tx) = router_with_bus();
        router.send_command(MeshAddr::GROUP, b"ALL:READ").unwrap();
        assert_eq!(router.in_flight, InFlight::Idle);
    }
}
