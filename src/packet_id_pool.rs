use crate::packet::PacketId;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Awaiting {
    PubAck,
    PubRec,
    PubComp,
    SubAck,
    UnsubAck,
}

#[derive(Clone, Copy)]
struct InFlight {
    id: PacketId,
    awaiting: Awaiting,
}

pub(crate) struct PacketIdPool<const N: usize> {
    in_flight: [Option<InFlight>; N],
    next_id: u16,
}

impl<const N: usize> PacketIdPool<N> {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: [None; N],
            next_id: 1,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.in_flight.fill(None);
        self.next_id = 1;
    }

    pub(crate) fn allocate(&mut self, awaiting: Awaiting) -> Result<PacketId, crate::Error> {
        let index = self
            .in_flight
            .iter()
            .position(Option::is_none)
            .ok_or(crate::Error::NoPacketIdAvailable)?;

        let id = self.next_id()?;
        self.in_flight[index] = Some(InFlight { id, awaiting });

        Ok(id)
    }

    pub(crate) fn awaiting(&self, id: PacketId) -> Option<Awaiting> {
        self.find(id)
            .and_then(|index| self.in_flight[index])
            .map(|entry| entry.awaiting)
    }

    /// PUBREC moves a QoS 2 publish on to waiting for PUBCOMP.
    pub(crate) fn on_pubrec(&mut self, id: PacketId) -> Result<(), crate::Error> {
        let entry = self
            .find(id)
            .and_then(|index| self.in_flight[index].as_mut())
            .ok_or(crate::Error::ProtocolViolation)?;

        match entry.awaiting {
            Awaiting::PubRec => {
                entry.awaiting = Awaiting::PubComp;
                Ok(())
            }
            Awaiting::PubComp => Ok(()),
            _ => Err(crate::Error::ProtocolViolation),
        }
    }

    pub(crate) fn release(&mut self, id: PacketId, ack: Awaiting) -> Result<(), crate::Error> {
        let index = self.find(id).ok_or(crate::Error::ProtocolViolation)?;

        match self.in_flight[index] {
            Some(entry) if entry.awaiting == ack => {
                self.in_flight[index] = None;
                Ok(())
            }
            _ => Err(crate::Error::ProtocolViolation),
        }
    }

    pub(crate) fn abandon(&mut self, id: PacketId) {
        if let Some(index) = self.find(id) {
            self.in_flight[index] = None;
        }
    }

    fn next_id(&mut self) -> Result<PacketId, crate::Error> {
        for _ in 0..u16::MAX {
            let id = PacketId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);

            if self.find(id).is_none() {
                return Ok(id);
            }
        }

        Err(crate::Error::NoPacketIdAvailable)
    }

    fn find(&self, id: PacketId) -> Option<usize> {
        self.in_flight
            .iter()
            .position(|entry| entry.map(|entry| entry.id) == Some(id))
    }
}
