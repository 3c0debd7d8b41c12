#[macro_use]
mod logging;
mod diagnostics;

mod ble_mesh;
mod executor;
mod gatt_link;
mod hardware;
mod identity;
mod router;
mod tasks;
mod version;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use dcmesh_common::{MeshAddr, NodeIdentity};
use esp_idf_hal::peripherals::Peripherals;

use ble_mesh::EspBleMeshBus;
use executor::Executor;
use router::Router;

fn main() -> Result<()> {
    diagnostics::print_memory_stats("STARTUP");
    let mem_after_startup = diagnostics::get_free_heap();

    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    diagnostics::print_memory_delta("After ESP-IDF init", mem_after_startup);

    info!("╔══════════════════════════════════════════════════════╗");
    info!("║  DC-mesh Universal Node firmware                      ║");
    info!("║  Version: {}                                        ║", version::FIRMWARE_VERSION);
    info!("╚══════════════════════════════════════════════════════╝");

    // Restore persisted identity exactly once, before advertising or
    // mesh-join (spec §4.4).
    let identity = identity::restore().unwrap_or_else(NodeIdentity::unprovisioned);
    if identity.is_provisioned() {
        info!(
            "restored identity: unicast=0x{:04X} node_id={}",
            identity.unicast_addr,
            identity.node_id()
        );
    } else {
        info!("no persisted identity found, booting unprovisioned");
    }
    let identity = Arc::new(Mutex::new(identity));

    // Taking the singleton now reserves it for the board-specific
    // AdcSensor/LedcPwm wiring a production build adds below.
    let _peripherals = Peripherals::take().unwrap();

    // Ordering constraint (spec §4.3): the link endpoint's service table
    // must be registered before mesh initialization locks it, and
    // advertising must only start after mesh init completes.
    let (command_tx, command_rx) = mpsc::channel::<Vec<u8>>();
    info!("main: registering link endpoint service table...");
    gatt_link::register_service(command_tx)?;

    info!("main: initializing BLE Mesh...");
    let (mesh_tx, mesh_rx) = mpsc::channel();
    let bus = EspBleMeshBus::init(mesh_tx, identity.lock().unwrap().client_model_bound)?;

    info!("main: starting link endpoint advertising...");
    gatt_link::start_advertising()?;

    let self_addr = MeshAddr(identity.lock().unwrap().unicast_addr);
    let node_id = identity.lock().unwrap().node_id();

    // Hardware sensor/PWM wiring is board-specific; the trait objects let
    // the executor stay agnostic (spec §1: "modelled as two abstract
    // interfaces"). A production board provides concrete `AdcSensor` /
    // `LedcPwm` instances wired to its voltage-divider and low-side switch
    // pins here.
    let executor = Arc::new(Mutex::new(Executor::new(
        node_id,
        Box::new(hardware::placeholder_sensor()),
        Box::new(hardware::placeholder_pwm()),
    )));

    let router = Arc::new(Mutex::new(Router::new(bus, self_addr, mesh_rx)));

    let worker_router = router.clone();
    let worker_executor = executor.clone();
    thread::spawn(move || {
        tasks::mesh_worker_loop(worker_router, worker_executor);
    });

    let command_router = router.clone();
    let command_executor = executor.clone();
    thread::spawn(move || {
        tasks::command_endpoint_task(command_rx, command_router, command_executor);
    });

    diagnostics::print_memory_delta("After task spawning", mem_after_startup);
    info!("main: node ready, advertising for a single host attachment");

    loop {
        thread::sleep(std::time::Duration::from_secs(1));
    }
}
