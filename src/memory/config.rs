/// Tunables for a partition heap.
///
/// Defaults match the hardening level of the build: cookies and poison fills
/// are on with debug assertions and off otherwise.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Discarded pages read back as either their old contents or zero.
    ///
    /// When set, purging may discard the page holding the freelist header of
    /// a free slot whose stored link encodes to zero (the last entry), since
    /// reading it back still yields the end-of-list marker. Windows
    /// `MEM_RESET` does not give this guarantee.
    pub discard_zero_fills: bool,
    /// Surround every allocation with 16-byte cookies and verify them on free.
    pub cookies: bool,
    /// Fill new allocations and recommitted spans with 0xAB and freed slots
    /// with 0xCD.
    pub poison: bool,
    /// Exponential spin rounds before the generic heap's lock parks.
    pub lock_spins: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            discard_zero_fills: !cfg!(windows),
            cookies: cfg!(debug_assertions),
            poison: cfg!(debug_assertions),
            lock_spins: 6,
        }
    }
}
