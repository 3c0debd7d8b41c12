//! Power Manager (C5, spec §4.5) — the host-side equilibrium controller.
//!
//! Grounded on the teacher's `ShowManager` shape: a struct holding mutable state,
//! driven by a single `tokio::spawn`ed cooperative loop (`start_show`/`start_show_worker`
//! there, [`PowerManager::run`] here), external callers reaching it only through a
//! channel rather than shared mutable state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dcmesh_common::Reply;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::PmStaticConfig;

/// `NodeStatus` (spec §3): owned exclusively by the Power Manager. Other host
/// components (the CLI's `read`) only ever see a cloned snapshot.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u16,
    pub duty: u8,
    pub target_duty: Option<u8>,
    pub commanded_duty: u8,
    pub voltage: f64,
    pub current_ma: f64,
    pub power_mw: f64,
    pub last_seen: Instant,
    pub responsive: bool,
    pub poll_generation: u64,
}

impl NodeStatus {
    fn new(node_id: u16) -> Self {
        Self {
            node_id,
            duty: 0,
            target_duty: None,
            commanded_duty: 0,
            voltage: 0.0,
            current_ma: 0.0,
            power_mw: 0.0,
            last_seen: Instant::now(),
            responsive: true,
            poll_generation: 0,
        }
    }

    fn observe(&mut self, duty_percent: u8, voltage: f64, current_ma: f64, generation: u64) {
        self.duty = duty_percent;
        self.voltage = voltage;
        self.current_ma = current_ma;
        // Recomputed, never trusted as an independent field (spec §3).
        self.power_mw = (voltage * current_ma).abs();
        self.last_seen = Instant::now();
        self.responsive = true;
        self.poll_generation = generation;
    }

    fn refresh_staleness(&mut self, stale_threshold: Duration) {
        if self.last_seen.elapsed() > stale_threshold {
            self.responsive = false;
        }
    }
}

/// Settings-phase calls (spec §4.5): external callers mutate PM state only
/// through this channel, never by reaching into `PowerManager` directly — the
/// same "no loop state touched off-loop" discipline spec §5 requires of the
/// radio callback, applied to the CLI as well.
#[derive(Debug)]
pub enum PmSetting {
    SetThreshold(Option<f64>),
    SetPriority(Option<u16>),
    /// CLI `read`: ask for a snapshot without reaching into PM state directly.
    QuerySnapshot(tokio::sync::oneshot::Sender<Vec<NodeStatus>>),
}

/// Everything the control loop needs to issue a command without depending on
/// the link supervisor's concrete type.
pub trait CommandSink: Send + Sync {
    fn send_command(&self, command: &str) -> Result<()>;
}

pub struct PowerManager<S: CommandSink> {
    config: PmStaticConfig,
    sink: Arc<S>,
    replies: mpsc::Receiver<Reply>,
    settings: mpsc::Receiver<PmSetting>,
    paused: Arc<AtomicBool>,
    nodes: HashMap<u16, NodeStatus>,
    threshold_mw: Option<f64>,
    priority_node_id: Option<u16>,
    poll_generation: u64,
}

impl<S: CommandSink> PowerManager<S> {
    pub fn new(
        config: PmStaticConfig,
        sink: Arc<S>,
        replies: mpsc::Receiver<Reply>,
        settings: mpsc::Receiver<PmSetting>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            sink,
            replies,
            settings,
            paused,
            nodes: HashMap::new(),
            threshold_mw: None,
            priority_node_id: None,
            poll_generation: 0,
        }
    }

    /// A read-only snapshot for the CLI's `read` / status display.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        let mut statuses: Vec<_> = self.nodes.values().cloned().collect();
        statuses.sort_by_key(|s| s.node_id);
        statuses
    }

    /// The single cooperative task loop (spec §4.5, §5). Cancelled only by
    /// shutdown; `paused` is left exactly as C6 set it on exit.
    pub async fn run(mut self) {
        loop {
            if self.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    Some(setting) = self.settings.recv() => self.apply_setting(setting),
                }
                continue;
            }

            if self.threshold_mw.is_none() {
                // Disabled: the control loop itself stops (spec §4.5), but we
                // still react promptly to a re-enable via the settings channel.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    Some(setting) = self.settings.recv() => {
                        self.apply_setting(setting);
                        if self.threshold_mw.is_some() {
                            self.poll_and_evaluate().await;
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {
                    self.poll_and_evaluate().await;
                }
                Some(setting) = self.settings.recv() => {
                    self.apply_setting(setting);
                    // Settings-phase bootstrap: force a poll even mid-interval.
                    self.poll_and_evaluate().await;
                }
            }
        }
    }

    fn apply_setting(&mut self, setting: PmSetting) {
        match setting {
            PmSetting::SetThreshold(None) => self.disable(),
            PmSetting::SetThreshold(Some(mw)) => {
                info!("power manager: threshold set to {mw} mW");
                self.threshold_mw = Some(mw);
            }
            PmSetting::SetPriority(id) => {
                info!("power manager: priority node set to {id:?}");
                self.priority_node_id = id;
            }
            PmSetting::QuerySnapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn disable(&mut self) {
        info!("power manager: disabled");
        self.threshold_mw = None;
        for status in self.nodes.values_mut() {
            if let Some(target) = status.target_duty {
                if status.commanded_duty != target {
                    let command = format!("{}:DUTY:{}", status.node_id, target);
                    if let Err(err) = self.sink.send_command(&command) {
                        warn!("failed to restore node {} to target duty: {err}", status.node_id);
                        continue;
                    }
                    status.commanded_duty = target;
                }
            }
        }
    }

    /// Poll phase + evaluate phase (spec §4.5).
    async fn poll_and_evaluate(&mut self) {
        self.poll_generation += 1;
        let generation = self.poll_generation;

        if let Err(err) = self.sink.send_command("ALL:READ") {
            warn!("poll: ALL:READ send failed: {err}");
            return;
        }

        let wait_window = Duration::from_secs(4);
        let deadline = Instant::now() + wait_window;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match timeout(remaining, self.replies.recv()).await {
                Ok(Some(reply)) => self.apply_reply(reply, generation),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        for status in self.nodes.values_mut() {
            status.refresh_staleness(self.config.stale_threshold());
        }

        self.evaluate();
    }

    fn apply_reply(&mut self, reply: Reply, generation: u64) {
        if let Reply::Data {
            node_id,
            duty_percent,
            voltage,
            current_ma,
            ..
        } = reply
        {
            let status = self
                .nodes
                .entry(node_id)
                .or_insert_with(|| NodeStatus::new(node_id));
            status.observe(duty_percent, voltage, current_ma, generation);
        }
    }

    /// The balancing algorithm (spec §4.5): weighted shares, deadbanded
    /// correction, unconditional `commanded_duty` update on nudge.
    fn evaluate(&mut self) {
        let Some(threshold) = self.threshold_mw else {
            return;
        };
        let budget = 0.9 * threshold;

        let responsive_ids: Vec<u16> = self
            .nodes
            .values()
            .filter(|n| n.responsive)
            .map(|n| n.node_id)
            .collect();
        if responsive_ids.is_empty() {
            return;
        }

        let weight = |id: u16| -> f64 {
            if self.priority_node_id == Some(id) {
                2.0
            } else {
                1.0
            }
        };
        let total_weight: f64 = responsive_ids.iter().map(|id| weight(*id)).sum();

        for id in responsive_ids {
            let share = budget * weight(id) / total_weight;
            let status = self.nodes.get(&id).expect("id came from self.nodes keys");
            let p_i = status.power_mw;
            let d_i = status.commanded_duty as i64;

            if (p_i - share).abs() <= self.config.deadband_mw {
                continue;
            }

            let new_duty = if p_i > share {
                let overshoot_ratio = (p_i - share) / share;
                let cut = (self.config.nudge_step as f64 * overshoot_ratio.ceil()) as i64;
                (d_i - cut).max(0)
            } else {
                (d_i + self.config.nudge_step as i64).min(100)
            };
            let new_duty = new_duty as u8;

            let command = format!("{}:DUTY:{}", id, new_duty);
            if let Err(err) = self.sink.send_command(&command) {
                warn!("evaluate: DUTY nudge to node {id} failed: {err}");
                continue;
            }

            debug!("node {id}: p={p_i:.1}mW share={share:.1}mW d={d_i}->{new_duty}");

            // Unconditional update: do not wait for the next reply to confirm
            // (spec §4.5's "crucial convergence rule" — gating on confirmation
            // produces indefinite oscillation given ~1s mesh round-trip).
            let status = self.nodes.get_mut(&id).expect("id came from self.nodes keys");
            status.commanded_duty = new_duty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    impl CommandSink for RecordingSink {
        fn send_command(&self, command: &str) -> Result<()> {
            self.sent.lock().unwrap().push(command.to_string());
            Ok(())
        }
    }

    fn test_config() -> PmStaticConfig {
        PmStaticConfig {
            poll_interval_secs: 2,
            stale_threshold_secs: 5,
            nudge_step: 5,
            deadband_mw: 50.0,
        }
    }

    fn pm_for_test() -> (
        PowerManager<RecordingSink>,
        Arc<RecordingSink>,
        mpsc::Sender<Reply>,
    ) {
        let sink = Arc::new(RecordingSink::default());
        let (_settings_tx, settings_rx) = mpsc::channel(8);
        let (replies_tx, replies_rx) = mpsc::channel(8);
        let pm = PowerManager::new(
            test_config(),
            sink.clone(),
            replies_rx,
            settings_rx,
            Arc::new(AtomicBool::new(false)),
        );
        (pm, sink, replies_tx)
    }

    #[test]
    fn over_budget_equal_priority_cuts_both_proportionally() {
        let (mut pm, sink, _replies_tx) = pm_for_test();
        pm.threshold_mw = Some(5000.0);
        pm.nodes.insert(1, {
            let mut status = NodeStatus::new(1);
            status.power_mw = 3000.0;
            status.commanded_duty = 60;
            status.responsive = true;
            status
        });
        pm.nodes.insert(2, {
            let mut status = NodeStatus::new(2);
            status.power_mw = 3000.0;
            status.commanded_duty = 60;
            status.responsive = true;
            status
        });

        pm.evaluate();

        // budget=4500, equal shares of 2250 each, both over by 750mW.
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(pm.nodes[&1].commanded_duty < 60);
        assert!(pm.nodes[&2].commanded_duty < 60);
    }

    #[test]
    fn within_deadband_is_left_alone() {
        let (mut pm, sink, _replies_tx) = pm_for_test();
        pm.threshold_mw = Some(1000.0);
        pm.nodes.insert(1, {
            let mut status = NodeStatus::new(1);
            status.power_mw = 900.0; // budget=900, share=900, exactly on target
            status.commanded_duty = 40;
            status.responsive = true;
            status
        });

        pm.evaluate();

        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(pm.nodes[&1].commanded_duty, 40);
    }

    #[test]
    fn priority_node_gets_double_share() {
        let (mut pm, _sink, _replies_tx) = pm_for_test();
        pm.threshold_mw = Some(3000.0);
        pm.priority_node_id = Some(1);
        pm.nodes.insert(1, {
            let mut status = NodeStatus::new(1);
            status.power_mw = 200.0;
            status.commanded_duty = 10;
            status.responsive = true;
            status
        });
        pm.nodes.insert(2, {
            let mut status = NodeStatus::new(2);
            status.power_mw = 200.0;
            status.commanded_duty = 10;
            status.responsive = true;
            status
        });

        // budget=2700, weights 2:1, shares 1800 and 900. Both nodes are way
        // under their share, so both should be nudged up by the same step;
        // the distinction shows up only once either node approaches its share.
        pm.evaluate();
        assert_eq!(pm.nodes[&1].commanded_duty, 15);
        assert_eq!(pm.nodes[&2].commanded_duty, 15);
    }

    #[test]
    fn under_budget_nudges_up_by_fixed_step() {
        let (mut pm, sink, _replies_tx) = pm_for_test();
        pm.threshold_mw = Some(10000.0);
        pm.nodes.insert(1, {
            let mut status = NodeStatus::new(1);
            status.power_mw = 100.0;
            status.commanded_duty = 20;
            status.responsive = true;
            status
        });

        pm.evaluate();

        assert_eq!(pm.nodes[&1].commanded_duty, 25);
        assert_eq!(sink.sent.lock().unwrap()[0], "1:DUTY:25");
    }

    #[test]
    fn duty_never_exceeds_bounds() {
        let (mut pm, _sink, _replies_tx) = pm_for_test();
        pm.threshold_mw = Some(10000.0);
        pm.nodes.insert(1, {
            let mut status = NodeStatus::new(1);
            status.power_mw = 1.0;
            status.commanded_duty = 99;
            status.responsive = true;
            status
        });

        pm.evaluate();

        assert!(pm.nodes[&1].commanded_duty <= 100);
    }

    #[test]
    fn disable_restores_target_duty() {
        let (mut pm, sink, _replies_tx) = pm_for_test();
        pm.threshold_mw = Some(5000.0);
        pm.nodes.insert(1, {
            let mut status = NodeStatus::new(1);
            status.commanded_duty = 10;
            status.target_duty = Some(80);
            status
        });

        pm.disable();

        assert_eq!(pm.nodes[&1].commanded_duty, 80);
        assert_eq!(sink.sent.lock().unwrap()[0], "1:DUTY:80");
        assert!(pm.threshold_mw.is_none());
    }
}
