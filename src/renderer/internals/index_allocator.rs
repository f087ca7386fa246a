use crate::renderer::error::RenderError;

/// Free-list of slot indices backed by a stack.
///
/// Not synchronized: callers hold it behind `&mut` from a single thread.
pub struct IndexAllocator {
    free: Vec<u32>,
    in_use: Vec<bool>,
    allocated: u32,
}

impl IndexAllocator {
    pub fn new(capacity: u32) -> Self {
        // Reversed so that the first allocations hand out 0, 1, 2, ...
        let free = (0..capacity).rev().collect();
        Self {
            free,
            in_use: vec![false; capacity as usize],
            allocated: 0,
        }
    }

    /// Returns `None` once every index is handed out.
    pub fn alloc(&mut self) -> Option<u32> {
        let index = self.free.pop()?;
        self.in_use[index as usize] = true;
        self.allocated += 1;
        Some(index)
    }

    pub fn free(&mut self, index: u32) -> Result<(), RenderError> {
        let capacity = self.capacity();
        if self.allocated == 0 {
            return Err(RenderError::IndexUnderflow { index, capacity });
        }
        match self.in_use.get_mut(index as usize) {
            Some(in_use) if *in_use => *in_use = false,
            _ => return Err(RenderError::IndexNotAllocated { index, capacity }),
        }
        self.allocated -= 1;
        self.free.push(index);
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.in_use.len() as u32
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn live_indices_are_distinct_until_exhausted() {
        let mut allocator = IndexAllocator::new(16);
        let live: HashSet<u32> = (0..16).map(|_| allocator.alloc().unwrap()).collect();
        assert_eq!(live.len(), 16);
        assert!(live.iter().all(|&index| index < 16));
        assert_eq!(allocator.alloc(), None);
        assert_eq!(allocator.allocated_count(), 16);
    }

    #[test]
    fn freed_indices_come_back_into_rotation() {
        let mut allocator = IndexAllocator::new(4);
        let indices: Vec<u32> = (0..4).map(|_| allocator.alloc().unwrap()).collect();
        allocator.free(indices[1]).unwrap();
        allocator.free(indices[3]).unwrap();

        let again: HashSet<u32> = (0..2).map(|_| allocator.alloc().unwrap()).collect();
        assert_eq!(again, HashSet::from([indices[1], indices[3]]));
        assert_eq!(allocator.alloc(), None);
    }

    #[test]
    fn free_without_allocations_underflows() {
        let mut allocator = IndexAllocator::new(4);
        assert!(matches!(allocator.free(0), Err(RenderError::IndexUnderflow { index: 0, capacity: 4 })));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut allocator = IndexAllocator::new(4);
        let a = allocator.alloc().unwrap();
        let _b = allocator.alloc().unwrap();
        allocator.free(a).unwrap();
        assert!(matches!(allocator.free(a), Err(RenderError::IndexNotAllocated { .. })));
        assert!(matches!(allocator.free(99), Err(RenderError::IndexNotAllocated { .. })));
        assert_eq!(allocator.allocated_count(), 1);
    }
}
