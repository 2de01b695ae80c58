use crate::Block;

type RingBuf<T, const CAP: usize> = arraydeque::ArrayDeque<T, CAP, arraydeque::Wrapping>;

/// Copies of recently transferred sectors, oldest evicted first.
///
/// A sector appears at most once.
pub struct BlockCache<const N: usize> {
    entries: RingBuf<(u64, Block), N>,
}

impl<const N: usize> BlockCache<N> {
    pub fn new() -> Self {
        Self {
            entries: RingBuf::new(),
        }
    }

    pub fn lookup(&self, sector: u64) -> Option<&Block> {
        self.entries
            .iter()
            .find(|(cached, _)| *cached == sector)
            .map(|(_, block)| block)
    }

    /// Remember `block` as the contents of `sector`, overwriting the
    /// sector's existing entry if it has one.
    pub fn store(&mut self, sector: u64, block: &Block) {
        if let Some((_, cached)) = self.entries.iter_mut().find(|(cached, _)| *cached == sector) {
            *cached = *block;
            return;
        }
        // a full ring drops its oldest entry
        let _ = self.entries.push_back((sector, *block));
    }

    pub fn invalidate(&mut self, sector: u64) {
        if let Some(index) = self.entries.iter().position(|(cached, _)| *cached == sector) {
            self.entries.remove(index);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<const N: usize> Default for BlockCache<N> {
    fn default() -> Self {
        Self::new()
    }
}
