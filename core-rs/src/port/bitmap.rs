//! Reservation bitmap: one bit per port number, 65536 bits.
//!
//! Not synchronized; `PortManager` owns it behind its state lock.

use crate::port::range::PORT_SPACE_SIZE;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = PORT_SPACE_SIZE / WORD_BITS;

#[derive(Clone)]
pub struct PortBitmap {
    words: Box<[u64]>,
    count: usize,
}

impl Default for PortBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBitmap {
    pub fn new() -> Self {
        PortBitmap {
            words: vec![0u64; WORDS].into_boxed_slice(),
            count: 0,
        }
    }

    fn locate(port: u16) -> (usize, u64) {
        let index = port as usize;
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    pub fn is_set(&self, port: u16) -> bool {
        let (word, mask) = Self::locate(port);
        self.words[word] & mask != 0
    }

    /// Set the bit for `port`. Returns false if it was already set.
    pub fn test_and_set(&mut self, port: u16) -> bool {
        let (word, mask) = Self::locate(port);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    /// Clear the bit for `port`. Returns false if it was not set.
    pub fn clear(&mut self, port: u16) -> bool {
        let (word, mask) = Self::locate(port);
        if self.words[word] & mask == 0 {
            return false;
        }
        self.words[word] &= !mask;
        self.count -= 1;
        true
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.count
    }

    /// First clear bit at or after `start`, wrapping around once, for which
    /// `eligible` holds. Whole words of set bits are skipped.
    pub fn find_clear_from<F>(&self, start: u16, mut eligible: F) -> Option<u16>
    where
        F: FnMut(u16) -> bool,
    {
        let start = start as usize;
        let mut index = start;
        let mut scanned = 0usize;

        while scanned < PORT_SPACE_SIZE {
            let word = self.words[index / WORD_BITS];
            if word == u64::MAX && index % WORD_BITS == 0 {
                index = (index + WORD_BITS) % PORT_SPACE_SIZE;
                scanned += WORD_BITS;
                continue;
            }
            if word & (1u64 << (index % WORD_BITS)) == 0 && eligible(index as u16) {
                return Some(index as u16);
            }
            index = (index + 1) % PORT_SPACE_SIZE;
            scanned += 1;
        }
        None
    }

    /// Ports whose bits are set, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = u16> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| (i * WORD_BITS + bit) as u16)
        })
    }
}

impl std::fmt::Debug for PortBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortBitmap")
            .field("count", &self.count)
            .finish()
    }
}
