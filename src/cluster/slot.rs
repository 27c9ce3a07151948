//! Hash slot calculation.
//!
//! Keys map to one of 16384 slots through CRC16/XMODEM, the same function
//! the servers use. Any other checksum would route keys to the wrong node.

use crc::{Crc, CRC_16_XMODEM};

/// Number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the cluster slot for a key.
///
/// If the key contains a non-empty `{...}` section, only the content of the
/// first such section is hashed, so related keys can be pinned to one slot.
///
/// # Examples
///
/// ```
/// use slotmux::key_slot;
///
/// assert_eq!(key_slot("foo"), 12182);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    CRC16.checksum(hash_tag(key.as_ref())) % SLOT_COUNT
}

/// Returns the part of `key` that is hashed.
///
/// - `{user1000}.following` hashes `user1000`
/// - `foo{}{bar}` hashes the whole key (the first tag is empty)
/// - `foo{bar` hashes the whole key
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    match key[open + 1..].iter().position(|&b| b == b'}') {
        Some(len) if len > 0 => &key[open + 1..open + 1 + len],
        _ => key,
    }
}
