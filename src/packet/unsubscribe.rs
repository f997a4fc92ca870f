use heapless::{String, Vec};

use crate::{
    config::{MAX_FILTERS, MAX_TOPIC_LEN},
    packet::{
        PacketId,
        encode::{self, Encode},
    },
    protocol::PacketType,
    topic,
};

#[derive(Clone, Debug, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: PacketId,
    pub topics: Vec<String<MAX_TOPIC_LEN>, MAX_FILTERS>,
}

impl Unsubscribe {
    pub(crate) fn single(packet_id: PacketId, filter: &str) -> Result<Self, crate::Error> {
        topic::validate_filter(filter)?;

        let mut topics = Vec::new();
        topics
            .push(String::try_from(filter).map_err(|_| crate::Error::BufferTooSmall)?)
            .map_err(|_| crate::Error::CapacityExceeded)?;

        Ok(Self { packet_id, topics })
    }
}

impl encode::EncodePacket for Unsubscribe {
    const PACKET_TYPE: PacketType = PacketType::Unsubscribe;

    fn flags(&self) -> u8 {
        0b0010
    }

    fn required_space(&self) -> usize {
        let mut required = self.packet_id.required_space();

        for topic in &self.topics {
            required += topic.as_str().required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        if self.topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        self.packet_id.encode(cursor)?;

        for topic in &self.topics {
            topic.as_str().encode(cursor)?;
        }

        Ok(())
    }
}
