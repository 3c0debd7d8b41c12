//! Shared wire-format, addressing and identity types for the DC-power mesh.
//!
//! This crate is consumed by both the node firmware (`dcmesh-node-firmware`) and the
//! host application (`dcmesh-host`). It carries no hardware or transport bindings of
//! its own — everything here is plain data and pure functions so both sides agree on
//! the byte-exact wire contract in spec §6 without duplicating it.

pub mod addr;
pub mod framing;
pub mod identity;
pub mod wire;

pub use addr::{MeshAddr, GROUP_ADDR, NODE_BASE_ADDR};
pub use framing::{fragment, Reassembler, MTU};
pub use identity::NodeIdentity;
pub use wire::{
    format_ack, format_data_reply, format_error, format_onoff, format_sent, format_timeout,
    parse_command, parse_local_shorthand, parse_reply, Error as WireError, ParsedCommand, Reply,
    Target, Verb,
};
