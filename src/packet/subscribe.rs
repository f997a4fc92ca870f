use heapless::{String, Vec};

use crate::{
    config::{MAX_FILTERS, MAX_TOPIC_LEN},
    packet::{
        PacketId, QoS,
        encode::{self, Encode},
    },
    protocol::PacketType,
    topic,
};

#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub topic_filter: String<MAX_TOPIC_LEN>,
    pub qos: QoS,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Subscribe {
    pub packet_id: PacketId,
    pub topics: Vec<Subscription, MAX_FILTERS>,
}

impl Subscribe {
    pub(crate) fn single(packet_id: PacketId, filter: &str, qos: QoS) -> Result<Self, crate::Error> {
        topic::validate_filter(filter)?;

        let mut topics = Vec::new();
        topics
            .push(Subscription {
                topic_filter: String::try_from(filter).map_err(|_| crate::Error::BufferTooSmall)?,
                qos,
            })
            .map_err(|_| crate::Error::CapacityExceeded)?;

        Ok(Self { packet_id, topics })
    }
}

impl encode::EncodePacket for Subscribe {
    const PACKET_TYPE: PacketType = PacketType::Subscribe;

    fn flags(&self) -> u8 {
        0b0010
    }

    fn required_space(&self) -> usize {
        let mut required = self.packet_id.required_space();

        for subscription in &self.topics {
            required += subscription.topic_filter.as_str().required_space() + 1;
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        if self.topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        self.packet_id.encode(cursor)?;

        for subscription in &self.topics {
            subscription.topic_filter.as_str().encode(cursor)?;
            subscription.qos.encode(cursor)?;
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubAckCode {
    Granted(QoS),
    Failure,
}

impl TryFrom<u8> for SubAckCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Self::Failure),
            qos => QoS::try_from(qos)
                .map(Self::Granted)
                .map_err(|_| crate::Error::MalformedPacket),
        }
    }
}

impl From<SubAckCode> for u8 {
    fn from(code: SubAckCode) -> Self {
        match code {
            SubAckCode::Granted(qos) => qos as u8,
            SubAckCode::Failure => 0x80,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubAck {
    pub packet_id: PacketId,
    pub return_codes: Vec<SubAckCode, MAX_FILTERS>,
}

impl encode::EncodePacket for SubAck {
    const PACKET_TYPE: PacketType = PacketType::SubAck;

    fn flags(&self) -> u8 {
        0
    }

    fn required_space(&self) -> usize {
        self.packet_id.required_space() + self.return_codes.len()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.packet_id.encode(cursor)?;

        for code in &self.return_codes {
            u8::from(*code).encode(cursor)?;
        }

        Ok(())
    }
}
