use heapless::Vec;

use crate::packet::PacketId;

pub(crate) struct Incoming<const N: usize> {
    awaiting_pubrel: Vec<PacketId, N>,
}

impl<const N: usize> Incoming<N> {
    pub(crate) fn new() -> Self {
        Self {
            awaiting_pubrel: Vec::new(),
        }
    }

    /// Returns `true` the first time `id` is seen, `false` for a retransmit
    /// that must not be delivered again.
    pub(crate) fn receive(&mut self, id: PacketId) -> Result<bool, crate::Error> {
        if self.awaiting_pubrel.contains(&id) {
            return Ok(false);
        }

        self.awaiting_pubrel
            .push(id)
            .map_err(|_| crate::Error::CapacityExceeded)?;

        Ok(true)
    }

    pub(crate) fn release(&mut self, id: PacketId) -> bool {
        match self.awaiting_pubrel.iter().position(|pending| *pending == id) {
            Some(index) => {
                self.awaiting_pubrel.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.awaiting_pubrel.clear();
    }
}
