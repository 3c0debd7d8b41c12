//! `EspBleMeshBus`: a [`crate::router::MeshBus`] backed by ESP-IDF's BLE Mesh
//! component (Generic OnOff Client/Server models).
//!
//! Grounded on the unsafe-FFI-wrapping idiom of the old WiFi-mesh
//! initialization (`esp!(...)` error mapping, one `unsafe extern "C"`
//! callback registered once at init, logging every event), transplanted from
//! the ESP-MESH event surface to the BLE Mesh model-layer event surface the
//! `client_model_bound` field of [`dcmesh_common::NodeIdentity`] implies.

use std::sync::mpsc::Sender;
use std::sync::Mutex;

use anyhow::Result;
use dcmesh_common::MeshAddr;
use esp_idf_sys::{self as sys, esp};
use log::*;
use once_cell::sync::OnceCell;

use crate::router::{MeshBus, MeshEvent, Opcode};

/// Company identifier for the custom model registered on this node, matching
/// the teacher's pattern of a single fixed network-identity constant
/// (`MESH_ID` in the old `mesh.rs`) rather than a runtime-chosen value.
const COMPANY_ID: u16 = 0x02E5;

/// The event queue is the only thing the BLE Mesh callback is allowed to
/// touch. Stored behind `OnceCell` because `esp_ble_mesh_register_*_callback`
/// takes a bare `extern "C" fn`, not a closure — the same constraint the old
/// `mesh_event_handler` worked around with module-level `Lazy` statics.
static EVENT_SENDER: OnceCell<Mutex<Sender<MeshEvent>>> = OnceCell::new();

/// Bridges an `esp_ble_mesh_*_model_cb_t` callback into a [`MeshEvent`] on the
/// channel, never touching router state directly (spec §5).
unsafe extern "C" fn model_event_handler(
    event: sys::esp_ble_mesh_model_cb_event_t,
    param: *mut sys::esp_ble_mesh_model_cb_param_t,
) {
    let Some(sender) = EVENT_SENDER.get() else {
        return;
    };
    let Ok(sender) = sender.lock() else {
        return;
    };

    if param.is_null() {
        return;
    }

    match event {
        sys::esp_ble_mesh_model_cb_event_t_ESP_BLE_MESH_MODEL_OPERATION_EVT => {
            let recv = (*param).model_operation;
            let src = MeshAddr(recv.ctx.addr);
            let dst = MeshAddr(recv.ctx.recv_dst);
            let payload = std::slice::from_raw_parts(recv.msg, recv.length as usize).to_vec();
            let opcode = if recv.opcode == sys::ESP_BLE_MESH_MODEL_OP_GEN_ONOFF_SET as u32 {
                Opcode::Cmd
            } else {
                Opcode::Reply
            };
            let _ = sender.send(MeshEvent::Recv {
                opcode,
                src,
                dst,
                payload,
            });
        }
        sys::esp_ble_mesh_model_cb_event_t_ESP_BLE_MESH_CLIENT_MODEL_SEND_COMP_EVT => {
            let comp = (*param).client_send_comp;
            let _ = sender.send(MeshEvent::SendComplete {
                ok: comp.err_code == 0,
            });
        }
        sys::esp_ble_mesh_model_cb_event_t_ESP_BLE_MESH_CLIENT_MODEL_RECV_PUBLISH_MSG_EVT => {
            let recv = (*param).client_recv_publish_msg;
            let src = MeshAddr(recv.ctx.addr);
            let payload = std::slice::from_raw_parts(recv.msg, recv.length as usize).to_vec();
            let _ = sender.send(MeshEvent::Reply { src, payload });
        }
        sys::esp_ble_mesh_model_cb_event_t_ESP_BLE_MESH_TIMEOUT_EVT => {
            let timeout = (*param).client_send_timeout;
            let _ = sender.send(MeshEvent::Timeout {
                target: MeshAddr(timeout.ctx.addr),
            });
        }
        _ => {
            debug!("unhandled BLE Mesh model event: {event}");
        }
    }
}

pub struct EspBleMeshBus {
    client_model_bound: bool,
}

impl EspBleMeshBus {
    /// Initializes the BLE Mesh stack and registers the model callback.
    ///
    /// **Must** be called after [`crate::gatt_link::register_service`] and
    /// before advertising is started (spec §4.3's ordering constraint): the
    /// underlying Bluedroid stack locks its service table at mesh init.
    pub fn init(events: Sender<MeshEvent>, client_model_bound: bool) -> Result<Self> {
        EVENT_SENDER
            .set(Mutex::new(events))
            .map_err(|_| anyhow::anyhow!("EspBleMeshBus::init called more than once"))?;

        unsafe {
            esp!(sys::esp_ble_mesh_init(
                &sys::esp_ble_mesh_prov_t {
                    ..std::mem::zeroed()
                },
                &sys::esp_ble_mesh_comp_t {
                    cid: COMPANY_ID,
                    ..std::mem::zeroed()
                }
            ))?;

            esp!(sys::esp_ble_mesh_register_custom_model_callback(Some(
                model_event_handler
            )))?;
        }

        info!("BLE Mesh initialized, company id 0x{:04X}", COMPANY_ID);
        Ok(Self {
            client_model_bound,
        })
    }

    pub fn client_model_bound(&self) -> bool {
        self.client_model_bound
    }
}

impl MeshBus for EspBleMeshBus {
    fn send(&self, dst: MeshAddr, opcode: Opcode, payload: &[u8], ttl: u8) -> Result<()> {
        let ctx = sys::esp_ble_mesh_msg_ctx_t {
            net_idx: 0,
            app_idx: 0,
            addr: dst.0,
            send_ttl: ttl,
            ..unsafe { std::mem::zeroed() }
        };

        let result = match opcode {
            Opcode::Cmd if self.client_model_bound => unsafe {
                sys::esp_ble_mesh_client_model_send_msg(
                    std::ptr::null_mut(),
                    &ctx as *const _ as *mut _,
                    sys::ESP_BLE_MESH_MODEL_OP_GEN_ONOFF_GET as u32,
                    payload.len() as u16,
                    payload.as_ptr() as *mut u8,
                    0,
                    false,
                    0,
                )
            },
            _ => unsafe {
                sys::esp_ble_mesh_server_model_send_msg(
                    std::ptr::null_mut(),
                    &ctx as *const _ as *mut _,
                    sys::ESP_BLE_MESH_MODEL_OP_GEN_ONOFF_STATUS as u32,
                    payload.len() as u16,
                    payload.as_ptr() as *mut u8,
                )
            },
        };

        if result != sys::ESP_OK as i32 {
            anyhow::bail!("BLE Mesh send to 0x{:04X} failed: {result}", dst.0);
        }
        Ok(())
    }
}
