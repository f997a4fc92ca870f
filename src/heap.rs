use heapless::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle {
    slot: u16,
    generation: u16,
}

struct Node<K> {
    key: K,
    slot: u16,
}

struct Slot<V> {
    index: usize,
    generation: u16,
    value: Option<V>,
}

// `nodes` is the heap proper; `slots` never move and record where their node is.
pub struct Heap<K, V, const N: usize> {
    nodes: Vec<Node<K>, N>,
    slots: [Slot<V>; N],
    free: Vec<u16, N>,
}

#[inline]
const fn left(i: usize) -> usize {
    2 * i + 1
}

#[inline]
const fn right(i: usize) -> usize {
    2 * i + 2
}

#[inline]
const fn parent(i: usize) -> usize {
    (i - 1) / 2
}

impl<K: Ord, V, const N: usize> Heap<K, V, N> {
    const CAPACITY_FITS: () = assert!(N <= u16::MAX as usize, "heap capacity must fit in u16");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::CAPACITY_FITS;

        let mut free = Vec::new();
        for slot in (0..N).rev() {
            // Capacity is N, cannot overflow.
            let _ = free.push(slot as u16);
        }

        Self {
            nodes: Vec::new(),
            slots: core::array::from_fn(|_| Slot {
                index: 0,
                generation: 0,
                value: None,
            }),
            free,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<Handle, crate::Error> {
        let slot = self.free.pop().ok_or(crate::Error::CapacityExceeded)?;
        let index = self.nodes.len();

        if self.nodes.push(Node { key, slot }).is_err() {
            // Free list and node array have the same capacity.
            let _ = self.free.push(slot);
            return Err(crate::Error::CapacityExceeded);
        }

        let entry = &mut self.slots[slot as usize];
        entry.index = index;
        entry.value = Some(value);
        let handle = Handle {
            slot,
            generation: entry.generation,
        };

        self.sift_up(index);

        Ok(handle)
    }

    pub fn peek_min(&self) -> Option<Handle> {
        let node = self.nodes.first()?;
        let slot = &self.slots[node.slot as usize];

        Some(Handle {
            slot: node.slot,
            generation: slot.generation,
        })
    }

    pub fn min_key(&self) -> Option<&K> {
        self.nodes.first().map(|node| &node.key)
    }

    pub fn extract_min(&mut self) -> Option<(K, V)> {
        if self.nodes.is_empty() {
            return None;
        }

        self.take(0)
    }

    pub fn key(&self, handle: Handle) -> Option<&K> {
        let index = self.position(handle).ok()?;
        Some(&self.nodes[index].key)
    }

    pub fn get(&self, handle: Handle) -> Option<&V> {
        self.position(handle).ok()?;
        self.slots[handle.slot as usize].value.as_ref()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.position(handle).is_ok()
    }

    pub fn update_key(&mut self, handle: Handle, key: K) -> Result<(), crate::Error> {
        let index = self.position(handle)?;
        self.nodes[index].key = key;

        let index = self.sift_up(index);
        self.sift_down(index);

        Ok(())
    }

    pub fn remove(&mut self, handle: Handle) -> Result<V, crate::Error> {
        let index = self.position(handle)?;
        self.take(index)
            .map(|(_, value)| value)
            .ok_or(crate::Error::InvalidHandle)
    }

    pub fn clear(&mut self) {
        while self.extract_min().is_some() {}
    }

    fn position(&self, handle: Handle) -> Result<usize, crate::Error> {
        let slot = handle.slot as usize;
        debug_assert!(slot < N, "handle from a heap of different capacity");

        match self.slots.get(slot) {
            Some(entry) if entry.generation == handle.generation && entry.value.is_some() => {
                Ok(entry.index)
            }
            _ => Err(crate::Error::InvalidHandle),
        }
    }

    /// Removes the node at `index` by swapping it with the last live node,
    /// then restores order from the vacated position.
    fn take(&mut self, index: usize) -> Option<(K, V)> {
        let last = self.nodes.len().checked_sub(1)?;
        if index != last {
            self.swap(index, last);
        }

        let node = self.nodes.pop()?;
        let entry = &mut self.slots[node.slot as usize];
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        let _ = self.free.push(node.slot);

        if index < self.nodes.len() {
            let index = self.sift_up(index);
            self.sift_down(index);
        }

        Some((node.key, value))
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.slots[self.nodes[a].slot as usize].index = a;
        self.slots[self.nodes[b].slot as usize].index = b;
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let up = parent(index);
            if self.nodes[index].key < self.nodes[up].key {
                self.swap(index, up);
                index = up;
            } else {
                break;
            }
        }

        index
    }

    fn sift_down(&mut self, mut index: usize) -> usize {
        let len = self.nodes.len();

        loop {
            let l = left(index);
            if l >= len {
                return index;
            }

            let r = right(index);
            // Equal children resolve to the left one.
            let child = if r < len && self.nodes[r].key < self.nodes[l].key {
                r
            } else {
                l
            };

            if self.nodes[child].key < self.nodes[index].key {
                self.swap(index, child);
                index = child;
            } else {
                return index;
            }
        }
    }
}

impl<K: Ord, V, const N: usize> Default for Heap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}
