//! Packet identifier allocation
//!
//! Identifiers are handed out in increasing order, wrapping from 65535 back
//! to 1 (0 is not a valid identifier), skipping any identifier that is still
//! held by an unacknowledged exchange.

const WORDS: usize = 65_536 / 64;

#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    in_use: Vec<u64>,
    next: u16,
    count: usize,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            in_use: vec![0; WORDS],
            next: 1,
            count: 0,
        }
    }

    /// Next free identifier, or `None` when all 65535 are taken.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.count == usize::from(u16::MAX) {
            return None;
        }
        loop {
            let id = self.next;
            self.next = if id == u16::MAX { 1 } else { id + 1 };
            if self.reserve(id) {
                return Some(id);
            }
        }
    }

    /// Mark a specific identifier as taken, e.g. when restoring a stored flow.
    /// Returns `false` if it was already taken or is 0.
    pub fn reserve(&mut self, id: u16) -> bool {
        if id == 0 || self.is_in_use(id) {
            return false;
        }
        let (word, bit) = Self::slot(id);
        self.in_use[word] |= bit;
        self.count += 1;
        true
    }

    /// Returns `false` if the identifier was not taken.
    pub fn release(&mut self, id: u16) -> bool {
        if !self.is_in_use(id) {
            return false;
        }
        let (word, bit) = Self::slot(id);
        self.in_use[word] &= !bit;
        self.count -= 1;
        true
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        let (word, bit) = Self::slot(id);
        self.in_use[word] & bit != 0
    }

    pub fn in_use(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.in_use.iter_mut().for_each(|word| *word = 0);
        self.count = 0;
    }

    fn slot(id: u16) -> (usize, u64) {
        (usize::from(id) / 64, 1u64 << (id % 64))
    }
}
