use crate::{
    packet::{
        connect::{ConnAck, Connect},
        encode::{Encode, encode_packet},
        publish::Publish,
        subscribe::{SubAck, Subscribe},
        unsubscribe::Unsubscribe,
    },
    protocol::PacketType,
};

pub mod connect;
pub mod encode;
pub mod publish;
pub mod subscribe;
pub mod unsubscribe;

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PacketId),
    PubRec(PacketId),
    PubRel(PacketId),
    PubComp(PacketId),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(PacketId),
    PingReq,
    PingResp,
    Disconnect,
}

impl Default for Message {
    fn default() -> Self {
        Self::PingReq
    }
}

impl Message {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    pub fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        match self {
            Self::Connect(packet) => encode_packet(packet, cursor),
            Self::ConnAck(packet) => encode_packet(packet, cursor),
            Self::Publish(packet) => encode_packet(packet, cursor),
            Self::Subscribe(packet) => encode_packet(packet, cursor),
            Self::SubAck(packet) => encode_packet(packet, cursor),
            Self::Unsubscribe(packet) => encode_packet(packet, cursor),
            Self::PubAck(id)
            | Self::PubRec(id)
            | Self::PubRel(id)
            | Self::PubComp(id)
            | Self::UnsubAck(id) => only_packet_id(cursor, self.packet_type(), *id),
            Self::PingReq | Self::PingResp | Self::Disconnect => {
                empty_body(cursor, self.packet_type())
            }
        }
    }
}

/// Writes `message` into `buf` and returns the number of bytes used.
pub fn serialize(message: &Message, buf: &mut [u8]) -> Result<usize, crate::Error> {
    let mut cursor = encode::Cursor::new(buf);
    message.encode(&mut cursor)?;

    Ok(cursor.position())
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let qos = match value {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            _ => return Err(crate::Error::InvalidQoS),
        };

        Ok(qos)
    }
}

impl encode::Encode for QoS {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (*self as u8).encode(cursor)
    }

    fn required_space(&self) -> usize {
        1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketId(pub(crate) u16);

impl PacketId {
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for PacketId {
    type Error = crate::Error;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        if id == 0 {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Self(id))
    }
}

impl encode::Encode for PacketId {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.0.encode(cursor)
    }

    fn required_space(&self) -> usize {
        2
    }
}

fn only_packet_id(
    cursor: &mut encode::Cursor,
    packet_type: PacketType,
    packet_id: PacketId,
) -> Result<(), crate::Error> {
    let header = ((packet_type as u8) << 4) | packet_type.fixed_flags();

    header.encode(cursor)?;
    2u8.encode(cursor)?;
    packet_id.encode(cursor)
}

fn empty_body(cursor: &mut encode::Cursor, packet_type: PacketType) -> Result<(), crate::Error> {
    let header = (packet_type as u8) << 4;

    header.encode(cursor)?;
    0u8.encode(cursor)
}
