//! Link Supervisor (C6, spec §4.6) — keeps the host attached to some node,
//! forever.
//!
//! The `BleCentral` trait is the transport seam; `BtleplugCentral` is the
//! concrete implementation. No example repo in this pack talks to a BLE
//! central, so `btleplug` — the standard, cross-platform Rust BLE-central
//! crate — is imported directly (documented in DESIGN.md), wired the way the
//! teacher wires any owned-client dependency: constructed once, held in the
//! supervisor struct, driven from the single event loop's `tokio::select!`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dcmesh_common::Reassembler;
use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::power_manager::CommandSink;

/// One device observed during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
}

/// The state machine (spec §4.6). `String` addresses keep this independent of
/// `btleplug`'s platform-specific `PeripheralId` type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting(String),
    Attached { address: String, peer_name: String },
    Reattaching,
}

/// User-driven transitions the CLI issues (spec §4.6: `Disconnected
/// --user-connect--> Scanning`). Loss-triggered reattachment is internal to
/// the supervisor and needs no control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkControl {
    Connect,
    Disconnect,
}

/// The transport seam C6 drives. A BLE central abstraction, not a mesh
/// abstraction — this is the point-to-point link to a single attached node.
#[async_trait]
pub trait BleCentral: Send {
    async fn scan(&mut self, timeout: Duration) -> Result<Vec<DiscoveredDevice>>;
    async fn connect(&mut self, address: &str) -> Result<()>;
    /// Forces a non-cached service/characteristic discovery and subscribes to
    /// notifications (spec §4.6's freshness policy). Returns the peer's
    /// advertised name once subscribed.
    async fn subscribe(&mut self) -> Result<String>;
    async fn write(&mut self, payload: &[u8]) -> Result<()>;
    async fn is_connected(&self) -> bool;
    async fn disconnect(&mut self) -> Result<()>;
    /// Next raw notification frame, if one has arrived. Non-blocking.
    async fn try_next_notification(&mut self) -> Option<Vec<u8>>;
}

pub struct LinkSupervisor<C: BleCentral> {
    central: C,
    config: LinkConfig,
    state: LinkState,
    last_connected_address: Option<String>,
    paused: Arc<AtomicBool>,
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<Vec<u8>>,
    control: mpsc::Receiver<LinkControl>,
    reassembler: Reassembler,
    attached: Arc<AtomicBool>,
}

/// Handle callers use to submit outbound commands without owning the
/// supervisor; `send_command` gates on attachment state (spec §4.6: "while
/// state != Attached ... fail fast with a warning; must not block").
pub struct LinkHandle {
    outbound: mpsc::Sender<String>,
    attached: Arc<AtomicBool>,
}

impl CommandSink for LinkHandle {
    fn send_command(&self, command: &str) -> Result<()> {
        if !self.attached.load(Ordering::SeqCst) {
            warn!("cannot send {command:?} — reconnecting");
            return Err(anyhow!("cannot send — reconnecting"));
        }
        self.outbound
            .try_send(command.to_string())
            .map_err(|err| anyhow!("command queue full or closed: {err}"))
    }
}

impl<C: BleCentral> LinkSupervisor<C> {
    pub fn new(
        central: C,
        config: LinkConfig,
        paused: Arc<AtomicBool>,
    ) -> (Self, LinkHandle, mpsc::Sender<LinkControl>, mpsc::Receiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (control_tx, control_rx) = mpsc::channel(8);
        let attached = Arc::new(AtomicBool::new(false));
        paused.store(true, Ordering::SeqCst);

        let supervisor = Self {
            central,
            config,
            state: LinkState::Disconnected,
            last_connected_address: None,
            paused,
            outbound: outbound_rx,
            inbound: inbound_tx,
            control: control_rx,
            reassembler: Reassembler::new(),
            attached: attached.clone(),
        };
        let handle = LinkHandle {
            outbound: outbound_tx,
            attached,
        };
        (supervisor, handle, control_tx, inbound_rx)
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Runs until the process shuts down. Starts `Disconnected` (spec §4.6:
    /// attachment only begins on a user `connect`) and drives the heartbeat,
    /// scan/connect attempts, outbound command forwarding and inbound
    /// notification reassembly from one task (spec §5: host side is a single
    /// event loop).
    pub async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.on_heartbeat().await,
                Some(command) = self.outbound.recv() => self.on_outbound(command).await,
                Some(control) = self.control.recv() => self.on_control(control).await,
                frame = self.central.try_next_notification(), if matches!(self.state, LinkState::Attached { .. }) => {
                    if let Some(frame) = frame {
                        self.on_notification(frame).await;
                    }
                }
            }
        }
    }

    async fn on_control(&mut self, control: LinkControl) {
        match control {
            LinkControl::Connect => {
                if self.state == LinkState::Disconnected {
                    self.state = LinkState::Scanning;
                    self.reattach().await;
                } else {
                    warn!("connect requested while already {:?}", self.state);
                }
            }
            LinkControl::Disconnect => {
                if let LinkState::Attached { address, .. } = &self.state {
                    info!("user-initiated disconnect from {address}");
                    let _ = self.central.disconnect().await;
                    self.attached.store(false, Ordering::SeqCst);
                    self.paused.store(true, Ordering::SeqCst);
                    self.state = LinkState::Disconnected;
                } else {
                    warn!("disconnect requested while not attached");
                }
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        if let LinkState::Attached { .. } = &self.state {
            if !self.central.is_connected().await {
                warn!("link supervisor: heartbeat detected loss of attachment");
                self.on_loss().await;
            }
        }
    }

    async fn on_outbound(&mut self, command: String) {
        if !matches!(self.state, LinkState::Attached { .. }) {
            warn!("dropping outbound command {command:?} — not attached");
            return;
        }
        if let Err(err) = self.central.write(command.as_bytes()).await {
            warn!("write failed, treating as link loss: {err}");
            self.on_loss().await;
        }
    }

    async fn on_notification(&mut self, frame: Vec<u8>) {
        if let Some(message) = self.reassembler.push(&frame) {
            if self.inbound.send(message).await.is_err() {
                warn!("link supervisor: notification consumer dropped");
            }
        }
    }

    async fn on_loss(&mut self) {
        self.attached.store(false, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
        self.state = LinkState::Reattaching;
        info!("link lost, pausing power manager and re-attaching");
        self.reattach().await;
    }

    /// Scan, try `last_connected_address` first, then the remainder, in a
    /// retry-forever loop (spec §4.6).
    async fn reattach(&mut self) {
        loop {
            self.state = LinkState::Scanning;
            let devices = match self.central.scan(self.config.scan_timeout()).await {
                Ok(devices) => devices,
                Err(err) => {
                    warn!("scan failed: {err}");
                    tokio::time::sleep(self.config.reattach_retry()).await;
                    continue;
                }
            };

            let mut ordered: Vec<&DiscoveredDevice> = Vec::with_capacity(devices.len());
            if let Some(last) = &self.last_connected_address {
                ordered.extend(devices.iter().filter(|d| &d.address == last));
                ordered.extend(devices.iter().filter(|d| &d.address != last));
            } else {
                ordered.extend(devices.iter());
            }

            for candidate in ordered {
                self.state = LinkState::Connecting(candidate.address.clone());
                if let Err(err) = self.central.connect(&candidate.address).await {
                    warn!("connect to {} failed: {err}", candidate.address);
                    continue;
                }
                match self.central.subscribe().await {
                    Ok(peer_name) => {
                        info!(
                            "[link-attached] new attachment: {} ({peer_name})",
                            candidate.address
                        );
                        self.last_connected_address = Some(candidate.address.clone());
                        self.state = LinkState::Attached {
                            address: candidate.address.clone(),
                            peer_name,
                        };
                        self.attached.store(true, Ordering::SeqCst);
                        self.paused.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        warn!("subscribe to {} failed: {err}", candidate.address);
                        let _ = self.central.disconnect().await;
                    }
                }
            }

            tokio::time::sleep(self.config.reattach_retry()).await;
        }
    }
}

/// Fixed, opaque-to-this-spec short identifiers for the link endpoint's GATT
/// service and its two characteristics (spec §6). Concrete values are shared
/// out-of-band with the firmware; placeholders here stand in for that shared
/// constant (real deployments source these from the same build-time config
/// both binaries read).
mod link_uuids {
    use uuid::{uuid, Uuid};

    pub const SERVICE: Uuid = uuid!("0000dc01-0000-1000-8000-00805f9b34fb");
    pub const SENSOR_DATA_CHAR: Uuid = uuid!("0000dc02-0000-1000-8000-00805f9b34fb");
    pub const COMMAND_CHAR: Uuid = uuid!("0000dc03-0000-1000-8000-00805f9b34fb");
}

/// `btleplug`-backed [`BleCentral`]. Holds the adapter and, once connected,
/// the peripheral handle plus its notification stream — constructed once at
/// startup and driven entirely from the supervisor's event loop.
pub struct BtleplugCentral {
    adapter: btleplug::platform::Adapter,
    peripheral: Option<btleplug::platform::Peripheral>,
    notifications:
        Option<std::pin::Pin<Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>>>,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self> {
        use btleplug::api::Central as _;
        use btleplug::platform::Manager;

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no BLE adapter found"))?;
        // Fail fast if the adapter can't even report its own state — surfaces
        // a missing/disabled radio before the supervisor's retry loop masks it.
        let _ = adapter.adapter_info().await?;
        Ok(Self {
            adapter,
            peripheral: None,
            notifications: None,
        })
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn scan(&mut self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        use btleplug::api::{Central as _, Peripheral as _, ScanFilter};

        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        let peripherals = self.adapter.peripherals().await?;
        self.adapter.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in peripherals {
            let properties = peripheral.properties().await?;
            let name = properties.and_then(|p| p.local_name);
            if name
                .as_deref()
                .map(|n| n.starts_with("DCMESH-"))
                .unwrap_or(false)
            {
                devices.push(DiscoveredDevice {
                    address: peripheral.id().to_string(),
                    name,
                });
            }
        }
        Ok(devices)
    }

    async fn connect(&mut self, address: &str) -> Result<()> {
        use btleplug::api::{Central as _, Peripheral as _};

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| anyhow!("device {address} no longer advertising"))?;
        peripheral.connect().await?;
        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<String> {
        use btleplug::api::Peripheral as _;
        use futures::StreamExt;

        let peripheral = self
            .peripheral
            .as_ref()
            .ok_or_else(|| anyhow!("subscribe called with no active connection"))?;

        // Force a non-cached discovery on every (re)attachment (spec §4.6:
        // stale handles cause "characteristic not found" on first write after
        // a peer reboot).
        peripheral.discover_services().await?;
        let characteristics = peripheral.characteristics();
        let sensor_char = characteristics
            .iter()
            .find(|c| c.uuid == link_uuids::SENSOR_DATA_CHAR)
            .ok_or_else(|| anyhow!("sensor-data characteristic not found"))?;
        peripheral.subscribe(sensor_char).await?;

        let stream = peripheral.notifications().await?;
        self.notifications = Some(Box::pin(stream));

        let properties = peripheral.properties().await?;
        let peer_name = properties
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| peripheral.id().to_string());
        Ok(peer_name)
    }

    async fn write(&mut self, payload: &[u8]) -> Result<()> {
        use btleplug::api::{Peripheral as _, WriteType};

        let peripheral = self
            .peripheral
            .as_ref()
            .ok_or_else(|| anyhow!("write called with no active connection"))?;
        let characteristics = peripheral.characteristics();
        let command_char = characteristics
            .iter()
            .find(|c| c.uuid == link_uuids::COMMAND_CHAR)
            .ok_or_else(|| anyhow!("command characteristic not found"))?;
        peripheral
            .write(command_char, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        use btleplug::api::Peripheral as _;
        match &self.peripheral {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        use btleplug::api::Peripheral as _;
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await?;
        }
        self.notifications = None;
        Ok(())
    }

    async fn try_next_notification(&mut self) -> Option<Vec<u8>> {
        use futures::StreamExt;
        let stream = self.notifications.as_mut()?;
        let notification = stream.next().await?;
        Some(notification.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeCentral {
        devices: Vec<DiscoveredDevice>,
        connect_fails_for: Vec<String>,
        subscribe_fails_for: Vec<String>,
        connected: bool,
        notifications: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl BleCentral for FakeCentral {
        async fn scan(&mut self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
            Ok(self.devices.clone())
        }

        async fn connect(&mut self, address: &str) -> Result<()> {
            if self.connect_fails_for.iter().any(|a| a == address) {
                return Err(anyhow!("refused"));
            }
            self.connected = true;
            Ok(())
        }

        async fn subscribe(&mut self) -> Result<String> {
            let address = match &self.state_hint() {
                Some(addr) => addr.clone(),
                None => return Err(anyhow!("no active connection")),
            };
            if self.subscribe_fails_for.iter().any(|a| a == &address) {
                return Err(anyhow!("missing service"));
            }
            Ok(format!("peer-{address}"))
        }

        async fn write(&mut self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        async fn try_next_notification(&mut self) -> Option<Vec<u8>> {
            self.notifications.lock().unwrap().pop()
        }
    }

    impl FakeCentral {
        // Test double shortcut: since `connect` doesn't remember which address
        // it last tried, `subscribe` needs that to decide pass/fail. Real
        // `BtleplugCentral` holds the connected peripheral directly instead.
        fn state_hint(&self) -> Option<String> {
            self.devices.first().map(|d| d.address.clone())
        }
    }

    fn test_config() -> LinkConfig {
        LinkConfig {
            advertised_name_prefix: "DCMESH-".to_string(),
            heartbeat_secs: 2,
            scan_timeout_secs: 5,
            reattach_retry_secs: 5,
        }
    }

    #[tokio::test]
    async fn reattach_prefers_last_connected_address() {
        let central = FakeCentral {
            devices: vec![
                DiscoveredDevice {
                    address: "AA".to_string(),
                    name: Some("DCMESH-1".to_string()),
                },
                DiscoveredDevice {
                    address: "BB".to_string(),
                    name: Some("DCMESH-2".to_string()),
                },
            ],
            connect_fails_for: vec![],
            subscribe_fails_for: vec![],
            connected: false,
            notifications: Mutex::new(vec![]),
        };
        let paused = Arc::new(AtomicBool::new(true));
        let (mut supervisor, _handle, _control, _inbound) =
            LinkSupervisor::new(central, test_config(), paused.clone());
        supervisor.last_connected_address = Some("AA".to_string());

        supervisor.reattach().await;

        assert!(matches!(supervisor.state(), LinkState::Attached { address, .. } if address == "AA"));
        assert!(!paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn command_gating_rejects_when_not_attached() {
        let central = FakeCentral {
            devices: vec![],
            connect_fails_for: vec![],
            subscribe_fails_for: vec![],
            connected: false,
            notifications: Mutex::new(vec![]),
        };
        let paused = Arc::new(AtomicBool::new(false));
        let (_supervisor, handle, _control, _inbound) =
            LinkSupervisor::new(central, test_config(), paused);

        assert!(handle.send_command("0:READ").is_err());
    }

    #[tokio::test]
    async fn starts_disconnected_until_user_connect() {
        let central = FakeCentral {
            devices: vec![DiscoveredDevice {
                address: "AA".to_string(),
                name: Some("DCMESH-1".to_string()),
            }],
            connect_fails_for: vec![],
            subscribe_fails_for: vec![],
            connected: false,
            notifications: Mutex::new(vec![]),
        };
        let paused = Arc::new(AtomicBool::new(false));
        let (mut supervisor, _handle, _control, _inbound) =
            LinkSupervisor::new(central, test_config(), paused.clone());
        assert_eq!(*supervisor.state(), LinkState::Disconnected);
        assert!(paused.load(Ordering::SeqCst));

        supervisor.on_control(LinkControl::Connect).await;
        assert!(matches!(supervisor.state(), LinkState::Attached { .. }));
        assert!(!paused.load(Ordering::SeqCst));

        supervisor.on_control(LinkControl::Disconnect).await;
        assert_eq!(*supervisor.state(), LinkState::Disconnected);
        assert!(paused.load(Ordering::SeqCst));
    }
}
