use heapless::{String, Vec};

use crate::{
    config::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN},
    packet::{
        PacketId, QoS,
        encode::{self, Encode},
    },
    protocol::PacketType,
    topic,
};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl TryFrom<u8> for Flags {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let dup = value & 0b1000 != 0;
        let qos = QoS::try_from((value >> 1) & 0b11)?;
        let retain = value & 0b0001 != 0;

        if dup && qos == QoS::AtMostOnce {
            return Err(crate::Error::InvalidFlags);
        }

        Ok(Self { dup, qos, retain })
    }
}

impl From<Flags> for u8 {
    fn from(value: Flags) -> Self {
        (value.dup as u8) << 3 | (value.qos as u8) << 1 | (value.retain as u8)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Publish {
    pub flags: Flags,
    pub topic: String<MAX_TOPIC_LEN>,
    pub packet_id: Option<PacketId>,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl Publish {
    /// Outgoing message. The packet identifier is assigned when it is sent.
    pub fn new(topic_name: &str, payload: &[u8], qos: QoS) -> Result<Self, crate::Error> {
        topic::validate_name(topic_name)?;

        Ok(Self {
            flags: Flags {
                qos,
                ..Default::default()
            },
            topic: String::try_from(topic_name).map_err(|_| crate::Error::BufferTooSmall)?,
            packet_id: None,
            payload: Vec::from_slice(payload).map_err(|_| crate::Error::BufferTooSmall)?,
        })
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.flags.retain = retain;
        self
    }
}

impl encode::EncodePacket for Publish {
    const PACKET_TYPE: PacketType = PacketType::Publish;

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.topic.as_str().encode(cursor)?;

        match (self.flags.qos, self.packet_id) {
            (QoS::AtMostOnce, _) => {}
            (_, Some(id)) => id.encode(cursor)?,
            (_, None) => return Err(crate::Error::MalformedPacket),
        }

        cursor.write_bytes(&self.payload)
    }

    fn flags(&self) -> u8 {
        self.flags.into()
    }

    fn required_space(&self) -> usize {
        let packet_id = match self.flags.qos {
            QoS::AtMostOnce => 0,
            _ => 2,
        };

        self.topic.as_str().required_space() + packet_id + self.payload.len()
    }
}
