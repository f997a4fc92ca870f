use heapless::{String, Vec};

use crate::{
    config::{Config, MAX_CLIENT_ID_LEN, MAX_CREDENTIAL_LEN, MAX_TOPIC_LEN, MAX_WILL_PAYLOAD_LEN},
    packet::{
        QoS,
        encode::{self, Encode},
    },
    protocol::PacketType,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name `MQIsdp`.
    V31,
    #[default]
    V311,
}

impl ProtocolVersion {
    pub const fn name(self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 => "MQTT",
        }
    }

    pub const fn level(self) -> u8 {
        match self {
            Self::V31 => 3,
            Self::V311 => 4,
        }
    }

    pub(crate) fn from_name(name: &str) -> Result<Self, crate::Error> {
        match name {
            "MQIsdp" => Ok(Self::V31),
            "MQTT" => Ok(Self::V311),
            _ => Err(crate::Error::MalformedPacket),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Will {
    pub qos: QoS,
    pub retain: bool,
    pub topic: String<MAX_TOPIC_LEN>,
    pub payload: Vec<u8, MAX_WILL_PAYLOAD_LEN>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Connect {
    pub protocol: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String<MAX_CLIENT_ID_LEN>,
    pub will: Option<Will>,
    pub username: Option<String<MAX_CREDENTIAL_LEN>>,
    pub password: Option<Vec<u8, MAX_CREDENTIAL_LEN>>,
}

impl From<&Config> for Connect {
    fn from(config: &Config) -> Self {
        Self {
            protocol: config.protocol_version,
            clean_session: config.clean_session,
            keep_alive: config.keep_alive,
            client_id: config.client_id.clone(),
            will: config.will.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

impl Connect {
    fn flags(&self) -> u8 {
        (self.username.is_some() as u8) << 7
            | (self.password.is_some() as u8) << 6
            | (self.will.as_ref().map(|w| w.retain).unwrap_or(false) as u8) << 5
            | self.will.as_ref().map(|w| w.qos as u8).unwrap_or(0) << 3 // 2 bits
            | (self.will.is_some() as u8) << 2
            | (self.clean_session as u8) << 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ConnectFlags {
    pub(crate) username: bool,
    pub(crate) password: bool,
    pub(crate) will_retain: bool,
    pub(crate) will_qos: QoS,
    pub(crate) will: bool,
    pub(crate) clean_session: bool,
}

impl TryFrom<u8> for ConnectFlags {
    type Error = crate::Error;

    fn try_from(flags: u8) -> Result<Self, Self::Error> {
        if flags & 0b0000_0001 != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let decoded = Self {
            username: flags & 0b1000_0000 != 0,
            password: flags & 0b0100_0000 != 0,
            will_retain: flags & 0b0010_0000 != 0,
            will_qos: QoS::try_from((flags >> 3) & 0b11)?,
            will: flags & 0b0000_0100 != 0,
            clean_session: flags & 0b0000_0010 != 0,
        };

        if !decoded.will && (decoded.will_retain || decoded.will_qos != QoS::AtMostOnce) {
            return Err(crate::Error::MalformedPacket);
        }

        if decoded.password && !decoded.username {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(decoded)
    }
}

impl encode::EncodePacket for Connect {
    const PACKET_TYPE: PacketType = PacketType::Connect;

    fn flags(&self) -> u8 {
        0
    }

    fn required_space(&self) -> usize {
        let mut required = self.protocol.name().required_space()
            + 1 // level
            + 1 // flags
            + self.keep_alive.required_space()
            + self.client_id.as_str().required_space();

        if let Some(will) = &self.will {
            required += will.topic.as_str().required_space();
            required += will.payload.as_slice().required_space();
        }

        if let Some(username) = &self.username {
            required += username.as_str().required_space();
        }

        if let Some(password) = &self.password {
            required += password.as_slice().required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.protocol.name().encode(cursor)?;
        self.protocol.level().encode(cursor)?;
        Connect::flags(self).encode(cursor)?;
        self.keep_alive.encode(cursor)?;
        self.client_id.as_str().encode(cursor)?;

        if let Some(will) = &self.will {
            will.topic.as_str().encode(cursor)?;
            will.payload.as_slice().encode(cursor)?;
        }

        if let Some(username) = &self.username {
            username.as_str().encode(cursor)?;
        }

        if let Some(password) = &self.password {
            password.as_slice().encode(cursor)?;
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub(crate) fn from_bytes(flags: u8, code: u8) -> Result<Self, crate::Error> {
        if flags & 0b1111_1110 != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(ConnAck {
            session_present: flags & 0b0000_0001 != 0,
            return_code: ConnectReturnCode::try_from(code)?,
        })
    }
}

impl encode::EncodePacket for ConnAck {
    const PACKET_TYPE: PacketType = PacketType::ConnAck;

    fn flags(&self) -> u8 {
        0
    }

    fn required_space(&self) -> usize {
        2
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (self.session_present as u8).encode(cursor)?;
        (self.return_code as u8).encode(cursor)
    }
}

// @note: return codes of MQTT 3.1 and 3.1.1 only
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => return Err(crate::Error::InvalidConnectReturnCode),
        };

        Ok(code)
    }
}
