//! Guest local storage and the read-only view of it that analysis uses.

use crate::isa::{LS_MASK, LS_SIZE};
use byteorder::{BigEndian, ByteOrder};

/// Read-only access to guest instruction words.
pub trait GuestStorage {
    /// Return the instruction word at the byte address `addr`, which is masked to an aligned
    /// position within the local storage.
    fn word(&self, addr: u32) -> u32;
}

/// A slice of words is treated as a local storage starting at address 0. Positions beyond the
/// end of the slice read as `0`.
impl GuestStorage for [u32] {
    fn word(&self, addr: u32) -> u32 {
        self.get(((addr & LS_MASK) >> 2) as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl GuestStorage for Vec<u32> {
    fn word(&self, addr: u32) -> u32 {
        self.as_slice().word(addr)
    }
}

/// A 256KiB SPU local storage. Words are stored big-endian, as on the guest.
pub struct LocalStorage {
    bytes: Box<[u8]>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; LS_SIZE as usize].into_boxed_slice(),
        }
    }

    /// Create a local storage with `words` copied in at `addr`.
    pub fn with_words(addr: u32, words: &[u32]) -> Self {
        let mut ls = Self::new();
        ls.write_words(addr, words);
        ls
    }

    pub fn write_word(&mut self, addr: u32, w: u32) {
        let off = (addr & LS_MASK) as usize;
        BigEndian::write_u32(&mut self.bytes[off..off + 4], w);
    }

    /// Copy `words` into consecutive positions from `addr`, wrapping around the end of the local
    /// storage.
    pub fn write_words(&mut self, addr: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.write_word(addr.wrapping_add((i as u32) << 2), *w);
        }
    }

    /// Do the words starting at `addr` equal `words`? Zero words in `words` are holes and match
    /// anything.
    pub fn matches(&self, addr: u32, words: &[u32]) -> bool {
        words.iter().enumerate().all(|(i, w)| {
            *w == 0 || self.word(addr.wrapping_add((i as u32) << 2)) == *w
        })
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestStorage for LocalStorage {
    fn word(&self, addr: u32) -> u32 {
        let off = (addr & LS_MASK) as usize;
        BigEndian::read_u32(&self.bytes[off..off + 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_words() {
        let mut ls = LocalStorage::new();
        ls.write_word(8, 0x4020_0000);
        assert_eq!(&ls.as_bytes()[8..12], &[0x40, 0x20, 0, 0]);
        assert_eq!(ls.word(8), 0x4020_0000);
        // Unaligned addresses are masked.
        assert_eq!(ls.word(9), 0x4020_0000);
    }

    #[test]
    fn holes_match_anything() {
        let ls = LocalStorage::with_words(0x100, &[1, 2, 3]);
        assert!(ls.matches(0x100, &[1, 0, 3]));
        assert!(!ls.matches(0x100, &[1, 2, 4]));
        assert!(!ls.matches(0x104, &[1, 2, 3]));
    }

    #[test]
    fn slices_as_storage() {
        let ws = [5u32, 6, 7];
        assert_eq!(ws[..].word(4), 6);
        assert_eq!(ws[..].word(0x100), 0);
    }
}
