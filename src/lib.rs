//! Host application: the equilibrium-based Power Manager (C5), the
//! attachment-maintaining Link Supervisor (C6), and the thin CLI that drives
//! both. No hardware bindings live here — those belong to the node firmware
//! crate; this crate only ever talks to one attached node over `BleCentral`.

pub mod cli;
pub mod config;
pub mod link_supervisor;
pub mod power_manager;

pub mod prelude {
    pub use crate::cli::*;
    pub use crate::config::*;
    pub use crate::link_supervisor::*;
    pub use crate::power_manager::*;
}
