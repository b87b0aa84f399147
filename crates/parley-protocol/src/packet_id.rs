//! Message id allocation for frames that need one.

/// Monotonic 16-bit message id counter.
///
/// Ids start at 1 and wrap from 65535 back to 1; 0 is never handed out.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl PacketIdAllocator {
    /// Create an allocator whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Take the next id.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_one() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_wraps_past_zero() {
        let mut ids = PacketIdAllocator { next: u16::MAX - 1 };
        assert_eq!(ids.next_id(), u16::MAX - 1);
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 1);
    }
}
