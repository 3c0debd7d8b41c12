use std::io::Write as _;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Error;
use chrono::Local;
use dcmesh_common::parse_reply;
use dcmesh_host::cli::Cli;
use dcmesh_host::config::Config;
use dcmesh_host::link_supervisor::{BtleplugCentral, LinkSupervisor};
use dcmesh_host::power_manager::PowerManager;
use log::{info, warn, LevelFilter};
use tokio::sync::mpsc;

fn init_logging() {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] ({}:{}) - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_logging();

    let config = Config::load()?;

    let central = match BtleplugCentral::new().await {
        Ok(central) => central,
        Err(err) => {
            log::error!("no BLE adapter available, cannot start link supervisor: {err}");
            std::process::exit(1);
        }
    };

    let paused = Arc::new(AtomicBool::new(true));
    let (supervisor, link_handle, control_tx, mut inbound_rx) =
        LinkSupervisor::new(central, config.link, paused.clone());
    let link_handle = Arc::new(link_handle);

    let (replies_tx, replies_rx) = mpsc::channel(32);
    let (settings_tx, settings_rx) = mpsc::channel(8);

    let power_manager = PowerManager::new(
        config.power_manager,
        link_handle.clone(),
        replies_rx,
        settings_rx,
        paused,
    );

    tokio::spawn(supervisor.run());
    tokio::spawn(power_manager.run());

    // The single consumer of the link's inbound notifications: parses the
    // wire contract once, hands `Reply::Data` frames to the Power Manager,
    // and logs everything else (acks, errors, `SENT:`) for the CLI's `read`
    // to be visible without a dedicated request/response match.
    tokio::spawn(async move {
        while let Some(message) = inbound_rx.recv().await {
            let Ok(line) = String::from_utf8(message) else {
                warn!("link: received non-UTF8 notification");
                continue;
            };
            match parse_reply(&line) {
                Some(reply) => {
                    if let dcmesh_common::Reply::Data { .. } = &reply {
                        if replies_tx.send(reply).await.is_err() {
                            warn!("power manager reply channel closed");
                        }
                    } else {
                        info!("link: {line}");
                    }
                }
                None => warn!("link: unparsable notification {line:?}"),
            }
        }
    });

    let cli = Cli::new(link_handle, control_tx, settings_tx);

    let exit_code = tokio::select! {
        code = cli.run() => code,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down on ctrl-c");
            0
        }
    };

    std::process::exit(exit_code);
}
