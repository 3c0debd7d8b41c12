//! Host CLI (AMBIENT + spec §6) — a thin, hand-rolled line-oriented REPL.
//!
//! Six verbs, no argument-parsing crate: `connect`, `disconnect`, `read`,
//! `duty <pct>`, `stop`, `threshold <mW>`/`threshold off`,
//! `priority <id>`/`priority off`, `quit`. Every verb is glue over a channel
//! already owned by C5 or C6 — the CLI holds no mesh or link state of its
//! own, matching spec §6's "thin glue, described abstractly".

use std::sync::Arc;

use log::{error, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::link_supervisor::LinkControl;
use crate::power_manager::{CommandSink, PmSetting};

pub struct Cli<S: CommandSink> {
    sink: Arc<S>,
    control: mpsc::Sender<LinkControl>,
    settings: mpsc::Sender<PmSetting>,
}

impl<S: CommandSink> Cli<S> {
    pub fn new(
        sink: Arc<S>,
        control: mpsc::Sender<LinkControl>,
        settings: mpsc::Sender<PmSetting>,
    ) -> Self {
        Self {
            sink,
            control,
            settings,
        }
    }

    /// Runs until `quit` or stdin closes. Returns the process exit code
    /// (spec §6: 0 on clean quit).
    pub async fn run(&self) -> i32 {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("dcmesh> connect | disconnect | read | duty <pct> | stop | threshold <mW>|off | priority <id>|off | quit");

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if self.dispatch(line.trim()).await {
                        return 0;
                    }
                }
                Ok(None) => return 0,
                Err(err) => {
                    error!("cli: failed to read stdin: {err}");
                    return 0;
                }
            }
        }
    }

    /// Returns `true` once the REPL should exit.
    async fn dispatch(&self, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }

        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_lowercase();
        let arg = parts.next();

        match verb.as_str() {
            "connect" => self.send_control(LinkControl::Connect).await,
            "disconnect" => self.send_control(LinkControl::Disconnect).await,
            "read" => self.read().await,
            "duty" => self.duty(arg),
            "stop" => self.raw("0:STOP"),
            "threshold" => self.threshold(arg).await,
            "priority" => self.priority(arg).await,
            "quit" => return true,
            other => warn!("unknown command {other:?}"),
        }
        false
    }

    async fn send_control(&self, control: LinkControl) {
        if self.control.send(control).await.is_err() {
            warn!("link supervisor is not running");
        }
    }

    fn raw(&self, command: &str) {
        if let Err(err) = self.sink.send_command(command) {
            warn!("{command}: {err}");
        }
    }

    /// `duty <pct>` talks straight to the attached node over the link
    /// (target `0`, spec §6: "0 means the node this command arrived on") —
    /// it does not populate `NodeStatus.target_duty`, since the CLI has no
    /// way to know which mesh node id the attached node will reply with.
    fn duty(&self, arg: Option<&str>) {
        let Some(pct) = arg.and_then(|a| a.parse::<u8>().ok()).filter(|p| *p <= 100) else {
            warn!("usage: duty <0-100>");
            return;
        };
        self.raw(&format!("0:DUTY:{pct}"));
    }

    async fn read(&self) {
        self.raw("0:READ");

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .settings
            .send(PmSetting::QuerySnapshot(reply_tx))
            .await
            .is_err()
        {
            warn!("power manager is not running");
            return;
        }

        match reply_rx.await {
            Ok(statuses) if statuses.is_empty() => println!("no node status observed yet"),
            Ok(statuses) => {
                for status in statuses {
                    println!(
                        "node {}: duty={}% commanded={}% {:.3}V {:.2}mA {:.1}mW responsive={}",
                        status.node_id,
                        status.duty,
                        status.commanded_duty,
                        status.voltage,
                        status.current_ma,
                        status.power_mw,
                        status.responsive,
                    );
                }
            }
            Err(_) => warn!("power manager dropped the snapshot request"),
        }
    }

    async fn threshold(&self, arg: Option<&str>) {
        let setting = match arg {
            Some("off") => PmSetting::SetThreshold(None),
            Some(value) => match value.parse::<f64>() {
                Ok(mw) => PmSetting::SetThreshold(Some(mw)),
                Err(_) => {
                    warn!("usage: threshold <mW> | threshold off");
                    return;
                }
            },
            None => {
                warn!("usage: threshold <mW> | threshold off");
                return;
            }
        };
        self.send_setting(setting).await;
    }

    async fn priority(&self, arg: Option<&str>) {
        let setting = match arg {
            Some("off") => PmSetting::SetPriority(None),
            Some(value) => match value.parse::<u16>() {
                Ok(id) => PmSetting::SetPriority(Some(id)),
                Err(_) => {
                    warn!("usage: priority <node-id> | priority off");
                    return;
                }
            },
            None => {
                warn!("usage: priority <node-id> | priority off");
                return;
            }
        };
        self.send_setting(setting).await;
    }

    async fn send_setting(&self, setting: PmSetting) {
        if self.settings.send(setting).await.is_err() {
            warn!("power manager is not running");
        }
    }
}
