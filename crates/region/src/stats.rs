//! Read-only snapshots of a pool's state

use core::fmt;

/// State of one block in a pool's chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Position in the chain, head first
    pub index: usize,
    /// Total bytes in the block
    pub capacity: usize,
    /// Bytes handed out, padding included
    pub used: usize,
    /// Bytes left after the cursor
    pub available: usize,
    /// Times block growth passed over this block
    pub failed: u32,
    /// Whether small allocations still probe this block
    pub probed: bool,
}

/// Where a pointer handed out by a pool lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Inside block memory, at the given chain index
    Block(usize),
    /// The start of a tracked large allocation
    Large,
}

/// Pool-wide snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks in the chain
    pub blocks: usize,
    /// Index of the first block probed for small allocations
    pub current: usize,
    /// Sum of every block's capacity
    pub capacity: usize,
    /// Block bytes handed out
    pub used: usize,
    /// Block bytes still available (in all blocks, probed or not)
    pub available: usize,
    /// Live large allocations
    pub large_live: usize,
    /// Large-list nodes, live or empty
    pub large_slots: usize,
    /// Bytes held by live large allocations
    pub large_bytes: usize,
    /// Registered cleanup entries
    pub cleanups: usize,
}

impl PoolStats {
    /// Fraction of block capacity handed out (0..1)
    pub fn utilization_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks: {} (current {}), used {}/{} bytes, large: {} live in {} slots ({} bytes), cleanups: {}",
            self.blocks,
            self.current,
            self.used,
            self.capacity,
            self.large_live,
            self.large_slots,
            self.large_bytes,
            self.cleanups
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization() {
        let stats = PoolStats {
            capacity: 200,
            used: 50,
            ..PoolStats::default()
        };
        assert!((stats.utilization_ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().utilization_ratio(), 0.0);
    }

    #[test]
    fn display() {
        let stats = PoolStats {
            blocks: 2,
            capacity: 2048,
            used: 1024,
            available: 1024,
            ..PoolStats::default()
        };
        assert_eq!(
            stats.to_string(),
            "blocks: 2 (current 0), used 1024/2048 bytes, large: 0 live in 0 slots (0 bytes), cleanups: 0"
        );
    }
}
