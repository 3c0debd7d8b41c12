//! The persisted `NodeIdentity` record (spec §3, §4.4, §6).
//!
//! Fixed-width, host-byte-order, no-padding layout so the node firmware's
//! NVS-backed store (`dcmesh-node-firmware::identity`) can write/read it as a single
//! record with an atomic shadow-write-then-swap, and so any length mismatch can be
//! rejected outright rather than partially decoded.

use serde::{Deserialize, Serialize};

/// Byte length of the packed record. Bump `RECORD_VERSION` and this constant together
/// if the layout ever changes; readers must reject anything that doesn't match.
pub const RECORD_LEN: usize = 9;
pub const RECORD_VERSION: u8 = 1;

/// One node's post-provisioning mesh identity, plus the client-model-bound flag.
///
/// Invariant: once `unicast_addr != 0` the record is *provisioned* and must be
/// restored before any mesh traffic is admitted (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub net_key_idx: u16,
    pub app_key_idx: u16,
    pub unicast_addr: u16,
    pub tid: u8,
    pub onoff: u8,
    pub client_model_bound: bool,
}

impl NodeIdentity {
    pub const fn unprovisioned() -> Self {
        Self {
            net_key_idx: 0,
            app_key_idx: 0,
            unicast_addr: 0,
            tid: 0,
            onoff: 0,
            client_model_bound: false,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        self.unicast_addr != 0
    }

    /// The node's small logical id, derived from its unicast address.
    pub fn node_id(&self) -> u16 {
        self.unicast_addr
            .saturating_sub(crate::addr::NODE_BASE_ADDR)
    }

    /// Pack into the fixed-width, little-endian, no-padding on-disk layout.
    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..2].copy_from_slice(&self.net_key_idx.to_le_bytes());
        buf[2..4].copy_from_slice(&self.app_key_idx.to_le_bytes());
        buf[4..6].copy_from_slice(&self.unicast_addr.to_le_bytes());
        buf[6] = self.tid;
        buf[7] = self.onoff;
        buf[8] = self.client_model_bound as u8;
        buf
    }

    /// Unpack from the on-disk layout. Rejects anything not exactly `RECORD_LEN`
    /// bytes long (spec §6: "implementations must reject records of unexpected
    /// length").
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_LEN {
            return None;
        }
        Some(Self {
            net_key_idx: u16::from_le_bytes([bytes[0], bytes[1]]),
            app_key_idx: u16::from_le_bytes([bytes[2], bytes[3]]),
            unicast_addr: u16::from_le_bytes([bytes[4], bytes[5]]),
            tid: bytes[6],
            onoff: bytes[7],
            client_model_bound: bytes[8] != 0,
        })
    }
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self::unprovisioned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let identity = NodeIdentity {
            net_key_idx: 1,
            app_key_idx: 2,
            unicast_addr: 0x0007,
            tid: 42,
            onoff: 1,
            client_model_bound: true,
        };

        let bytes = identity.to_bytes();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(NodeIdentity::from_bytes(&bytes), Some(identity));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(NodeIdentity::from_bytes(&[0u8; 3]), None);
        assert_eq!(NodeIdentity::from_bytes(&[0u8; RECORD_LEN + 1]), None);
    }

    #[test]
    fn unprovisioned_has_zero_unicast() {
        let identity = NodeIdentity::unprovisioned();
        assert!(!identity.is_provisioned());
    }

    #[test]
    fn node_id_derived_from_unicast() {
        let identity = NodeIdentity {
            unicast_addr: crate::addr::NODE_BASE_ADDR + 3,
            ..NodeIdentity::unprovisioned()
        };
        assert_eq!(identity.node_id(), 3);
    }
}
