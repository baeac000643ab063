/// Hands out the global order index. Only the leader replica owns one.
///
/// All handling happens on the leader's single receive loop, so a plain
/// counter yields a gap-free, strictly increasing sequence.
#[derive(Debug, Default)]
pub struct OrderAssigner {
    next_index: u64,
}

impl OrderAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index for the next write and advances the counter.
    pub fn assign(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}
