use super::{Block, BLOCK_SIZE};
use bitvec::{order::Lsb0, view::BitView};

/// Allocation over one bitmap block, limited to the first `capacity` bits.
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    capacity: usize,
}

impl Allocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: (capacity as usize).min(BLOCK_SIZE * 8),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Lowest clear bit, or `None` when every slot is taken.
    pub fn find_free(&self, bitmap: &Block) -> Option<u32> {
        bitmap.view_bits::<Lsb0>()[..self.capacity]
            .first_zero()
            .map(|i| i as u32)
    }

    pub fn mark(&self, bitmap: &mut Block, index: u32) {
        assert!((index as usize) < self.capacity, "slot {} out of range", index);
        bitmap.view_bits_mut::<Lsb0>().set(index as usize, true);
    }

    pub fn is_allocated(&self, bitmap: &Block, index: u32) -> bool {
        (index as usize) < self.capacity && bitmap.view_bits::<Lsb0>()[index as usize]
    }

    pub fn allocated(&self, bitmap: &Block) -> u32 {
        bitmap.view_bits::<Lsb0>()[..self.capacity].count_ones() as u32
    }
}
