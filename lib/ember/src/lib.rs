#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Identifier of a node in the replication mesh.
pub type PeerId = u8;

/// Smallest identifier a node may claim.
pub const MIN_PEER_ID: PeerId = 1;
/// Largest identifier a node may claim.
pub const MAX_PEER_ID: PeerId = 127;

/// Returns true if the supplied identifier may appear on the wire.
#[inline]
pub fn valid_peer_id(id: PeerId) -> bool {
    id >= MIN_PEER_ID && id <= MAX_PEER_ID
}

pub mod logging;
pub mod time;
