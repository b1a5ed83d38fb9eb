//! Generational slot allocator.
//!
//! Pools hand out `(index, generation)` handles into a fixed-capacity slot
//! array. Freeing a slot bumps its generation, so any handle minted before the
//! free fails validation forever after — dangling references are caught in
//! O(1) without garbage collection or pointer rewriting, even once the slot
//! index has been reused.

/// An opaque `(index, generation)` reference into a [`HandlePool`].
///
/// Two handles are equal only if both index and generation match; a handle
/// whose slot has since been freed never compares equal to the slot's current
/// occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity pool of slots with use-after-free detection.
///
/// `alloc` reuses freed slots LIFO, otherwise advances a high-water mark;
/// exhausting the capacity is a fatal usage error, since pool sizes are meant
/// to be provisioned generously at startup.
#[derive(Debug)]
pub struct HandlePool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: u32,
}

impl<T> HandlePool<T> {
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// Allocate a slot for `value` and return its handle.
    ///
    /// # Panics
    ///
    /// Panics if the pool's fixed capacity is exhausted.
    pub fn alloc(&mut self, value: T) -> Handle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].value = Some(value);
                index
            }
            None => {
                assert!(
                    (self.slots.len() as u32) < self.capacity,
                    "handle pool capacity exhausted ({})",
                    self.capacity
                );
                let index = self.slots.len() as u32;
                // Generations start at 1, matching descriptor heap convention.
                self.slots.push(Slot {
                    generation: 1,
                    value: Some(value),
                });
                index
            }
        };

        Handle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Release the slot behind `handle`, invalidating it and every copy of it.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is stale or was already freed.
    pub fn free(&mut self, handle: Handle) -> T {
        self.validate(handle);
        let slot = &mut self.slots[handle.index as usize];
        slot.generation += 1;
        self.free.push(handle.index);
        slot.value.take().expect("slot already empty")
    }

    /// Check a handle without panicking.
    pub fn is_valid(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index as usize)
            .map(|slot| slot.generation == handle.generation && slot.value.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, handle: Handle) -> &T {
        self.validate(handle);
        self.slots[handle.index as usize]
            .value
            .as_ref()
            .expect("slot empty")
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut T {
        self.validate(handle);
        self.slots[handle.index as usize]
            .value
            .as_mut()
            .expect("slot empty")
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn validate(&self, handle: Handle) {
        assert!(
            (handle.index as usize) < self.slots.len(),
            "handle index {} out of range",
            handle.index
        );
        let slot = &self.slots[handle.index as usize];
        assert!(
            slot.generation == handle.generation,
            "stale handle: generation {} does not match slot generation {}",
            handle.generation,
            slot.generation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_get_free() {
        let mut pool = HandlePool::with_capacity(8);
        let a = pool.alloc("a");
        let b = pool.alloc("b");

        assert_eq!(*pool.get(a), "a");
        assert_eq!(*pool.get(b), "b");
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.free(a), "a");
        assert_eq!(pool.len(), 1);
        assert!(!pool.is_valid(a));
        assert!(pool.is_valid(b));
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        // Capacity-4 heap: allocate 4, free one, allocate again.
        let mut pool = HandlePool::with_capacity(4);
        let handles: Vec<_> = (0..4).map(|i| pool.alloc(i)).collect();

        let freed = handles[2];
        assert_eq!(freed.generation(), 1);
        pool.free(freed);

        let reused = pool.alloc(42);
        assert_eq!(reused.index(), freed.index());
        assert_eq!(reused.generation(), 2);
        assert!(pool.is_valid(reused));
        assert!(!pool.is_valid(freed));
        assert_eq!(*pool.get(reused), 42);
    }

    #[test]
    fn test_free_is_lifo() {
        let mut pool = HandlePool::with_capacity(8);
        let a = pool.alloc(0);
        let b = pool.alloc(1);
        pool.free(a);
        pool.free(b);

        // Most recently freed slot comes back first.
        assert_eq!(pool.alloc(2).index(), b.index());
        assert_eq!(pool.alloc(3).index(), a.index());
    }

    #[test]
    #[should_panic(expected = "capacity exhausted")]
    fn test_capacity_exhaustion_panics() {
        let mut pool = HandlePool::with_capacity(2);
        pool.alloc(0);
        pool.alloc(1);
        pool.alloc(2);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_stale_handle_panics() {
        let mut pool = HandlePool::with_capacity(2);
        let a = pool.alloc(0);
        pool.free(a);
        pool.alloc(1); // reuses the slot
        pool.get(a);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_double_free_panics() {
        let mut pool = HandlePool::with_capacity(2);
        let a = pool.alloc(0);
        pool.free(a);
        pool.free(a);
    }
}
