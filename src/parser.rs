use heapless::{String, Vec};

use crate::{
    config::{
        MAX_CLIENT_ID_LEN, MAX_CREDENTIAL_LEN, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, MAX_WILL_PAYLOAD_LEN,
    },
    packet::{
        Message, PacketId, QoS,
        connect::{ConnAck, Connect, ConnectFlags, ProtocolVersion, Will},
        publish::{Flags, Publish},
        subscribe::{SubAck, SubAckCode, Subscribe, Subscription},
        unsubscribe::Unsubscribe,
    },
    protocol::{FixedHeader, PacketType},
};

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseStatus {
    Continue,
    Incomplete,
    Done,
    /// A variable-length field of the given size does not fit its storage.
    /// Call [`Parser::discard`] to drop the packet and carry on.
    WantMemory(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    Initial,
    RemainingLength,
    VariableHeader,
    ConnectProtocolName,
    ConnectProtocolVersion,
    ConnectFlags,
    ConnectKeepAlive,
    ConnectClientId,
    ConnectWillTopic,
    ConnectWillMessage,
    ConnectUsername,
    ConnectPassword,
    ConnAck,
    PublishTopicName,
    PublishMessageId,
    PublishPayload,
    MessageId,
    SubscribeMessageId,
    SubscribeFilter,
    SubscribeQos,
    SubAckMessageId,
    SubAckCodes,
    UnsubscribeMessageId,
    UnsubscribeFilter,
    Empty,
    Discard,
    /// Framing is lost; only [`Parser::reset`] recovers.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemainingLength {
    digits: u8,
    multiplier: usize,
    total: usize,
}

impl RemainingLength {
    pub const fn new() -> Self {
        Self {
            digits: 0,
            multiplier: 1,
            total: 0,
        }
    }

    /// Feeds one byte. Returns the value once the last byte has been seen.
    pub fn push(&mut self, byte: u8) -> Result<Option<usize>, crate::Error> {
        if self.digits == 4 {
            return Err(crate::Error::MalformedRemainingLength);
        }

        self.total += (byte & 0x7F) as usize * self.multiplier;
        self.multiplier *= 128;
        self.digits += 1;

        if byte & 0x80 == 0 {
            Ok(Some(self.total))
        } else if self.digits == 4 {
            Err(crate::Error::MalformedRemainingLength)
        } else {
            Ok(None)
        }
    }
}

impl Default for RemainingLength {
    fn default() -> Self {
        Self::new()
    }
}

enum Field {
    Pending,
    Ready,
    TooLarge(usize),
}

struct Input<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn take(&mut self, max: usize) -> &'a [u8] {
        let end = self.bytes.len().min(self.pos + max);
        let chunk = &self.bytes[self.pos..end];
        self.pos = end;
        chunk
    }
}

macro_rules! variant {
    ($message:expr, $variant:ident) => {
        match $message {
            Message::$variant(inner) => inner,
            _ => return Err(crate::Error::MalformedPacket),
        }
    };
}

pub struct Parser {
    state: State,
    header: Option<FixedHeader>,
    length: RemainingLength,
    remaining: usize,
    high_byte: Option<u8>,
    field_len: Option<usize>,
    scratch: Vec<u8, MAX_TOPIC_LEN>,
    connect_flags: ConnectFlags,
    blocked: Option<usize>,
    consumed: usize,
    error: Option<crate::Error>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Initial,
            header: None,
            length: RemainingLength::new(),
            remaining: 0,
            high_byte: None,
            field_len: None,
            scratch: Vec::new(),
            connect_flags: ConnectFlags::default(),
            blocked: None,
            consumed: 0,
            error: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Bytes taken from the input of the last `step`/`execute` call.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn last_error(&self) -> Option<crate::Error> {
        self.error
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Initial
    }

    /// Drops the rest of the current packet, typically after `WantMemory`.
    pub fn discard(&mut self) {
        if self.state == State::Failed {
            return;
        }

        self.blocked = None;
        self.high_byte = None;
        self.field_len = None;
        self.state = match self.state {
            State::Initial | State::RemainingLength => self.state,
            _ => State::Discard,
        };
    }

    pub fn execute(
        &mut self,
        message: &mut Message,
        input: &[u8],
    ) -> Result<ParseStatus, crate::Error> {
        let mut input = Input::new(input);

        let result = loop {
            match self.advance(message, &mut input) {
                Ok(ParseStatus::Continue) => continue,
                other => break other,
            }
        };

        self.consumed = input.pos;
        result
    }

    pub fn step(&mut self, message: &mut Message, input: &[u8]) -> Result<ParseStatus, crate::Error> {
        let mut input = Input::new(input);
        let result = self.advance(message, &mut input);
        self.consumed = input.pos;
        result
    }

    fn advance(
        &mut self,
        message: &mut Message,
        input: &mut Input,
    ) -> Result<ParseStatus, crate::Error> {
        if let Some(size) = self.blocked {
            return Ok(ParseStatus::WantMemory(size));
        }

        match self.transition(message, input) {
            Ok(ParseStatus::WantMemory(size)) => {
                self.blocked = Some(size);
                Ok(ParseStatus::WantMemory(size))
            }
            Ok(status) => Ok(status),
            Err(err) => {
                self.error = Some(err);
                self.high_byte = None;
                self.field_len = None;
                self.state = match self.state {
                    State::Initial | State::RemainingLength | State::Failed => State::Failed,
                    _ => State::Discard,
                };
                Err(err)
            }
        }
    }

    fn transition(
        &mut self,
        message: &mut Message,
        input: &mut Input,
    ) -> Result<ParseStatus, crate::Error> {
        use ParseStatus::{Continue, Done, Incomplete, WantMemory};

        match self.state {
            State::Initial => {
                let Some(byte) = input.next() else {
                    return Ok(Incomplete);
                };

                let header = FixedHeader::try_from(byte)?;
                if header.packet_type == PacketType::Publish {
                    Flags::try_from(header.flags)?;
                }

                self.header = Some(header);
                self.length = RemainingLength::new();
                self.error = None;
                self.state = State::RemainingLength;
                Ok(Continue)
            }
            State::RemainingLength => {
                let Some(byte) = input.next() else {
                    return Ok(Incomplete);
                };

                if let Some(total) = self.length.push(byte)? {
                    self.remaining = total;
                    self.state = State::VariableHeader;
                }
                Ok(Continue)
            }
            State::VariableHeader => {
                let header = self.header.ok_or(crate::Error::MalformedPacket)?;

                self.state = match header.packet_type {
                    PacketType::Connect => {
                        *message = Message::Connect(Connect::default());
                        State::ConnectProtocolName
                    }
                    PacketType::ConnAck => State::ConnAck,
                    PacketType::Publish => {
                        *message = Message::Publish(Publish {
                            flags: Flags::try_from(header.flags)?,
                            ..Default::default()
                        });
                        State::PublishTopicName
                    }
                    PacketType::PubAck
                    | PacketType::PubRec
                    | PacketType::PubRel
                    | PacketType::PubComp
                    | PacketType::UnsubAck => State::MessageId,
                    PacketType::Subscribe => State::SubscribeMessageId,
                    PacketType::SubAck => State::SubAckMessageId,
                    PacketType::Unsubscribe => State::UnsubscribeMessageId,
                    PacketType::PingReq | PacketType::PingResp | PacketType::Disconnect => {
                        State::Empty
                    }
                };
                Ok(Continue)
            }
            State::ConnectProtocolName => match self.text(input, 6)? {
                Field::Ready => {
                    let name = core::str::from_utf8(&self.scratch)
                        .map_err(|_| crate::Error::InvalidUtf8)?;
                    variant!(message, Connect).protocol = ProtocolVersion::from_name(name)?;
                    self.state = State::ConnectProtocolVersion;
                    Ok(Continue)
                }
                Field::Pending => Ok(Incomplete),
                Field::TooLarge(_) => Err(crate::Error::MalformedPacket),
            },
            State::ConnectProtocolVersion => {
                let Some(level) = self.byte(input)? else {
                    return Ok(Incomplete);
                };

                if variant!(message, Connect).protocol.level() != level {
                    return Err(crate::Error::MalformedPacket);
                }
                self.state = State::ConnectFlags;
                Ok(Continue)
            }
            State::ConnectFlags => {
                let Some(byte) = self.byte(input)? else {
                    return Ok(Incomplete);
                };

                self.connect_flags = ConnectFlags::try_from(byte)?;
                variant!(message, Connect).clean_session = self.connect_flags.clean_session;
                self.state = State::ConnectKeepAlive;
                Ok(Continue)
            }
            State::ConnectKeepAlive => {
                let Some(keep_alive) = self.word(input)? else {
                    return Ok(Incomplete);
                };

                variant!(message, Connect).keep_alive = keep_alive;
                self.state = State::ConnectClientId;
                Ok(Continue)
            }
            State::ConnectClientId => match self.text(input, MAX_CLIENT_ID_LEN)? {
                Field::Ready => {
                    let connect = variant!(message, Connect);
                    self.fill(&mut connect.client_id)?;

                    self.state = if self.connect_flags.will {
                        connect.will = Some(Will {
                            qos: self.connect_flags.will_qos,
                            retain: self.connect_flags.will_retain,
                            topic: String::new(),
                            payload: Vec::new(),
                        });
                        State::ConnectWillTopic
                    } else {
                        self.after_will()
                    };
                    self.connect_done_or(Continue)
                }
                Field::Pending => Ok(Incomplete),
                Field::TooLarge(size) => Ok(WantMemory(size)),
            },
            State::ConnectWillTopic => match self.text(input, MAX_TOPIC_LEN)? {
                Field::Ready => {
                    let will = variant!(message, Connect)
                        .will
                        .as_mut()
                        .ok_or(crate::Error::MalformedPacket)?;
                    self.fill(&mut will.topic)?;
                    self.state = State::ConnectWillMessage;
                    Ok(Continue)
                }
                Field::Pending => Ok(Incomplete),
                Field::TooLarge(size) => Ok(WantMemory(size)),
            },
            State::ConnectWillMessage => {
                let will = variant!(message, Connect)
                    .will
                    .as_mut()
                    .ok_or(crate::Error::MalformedPacket)?;

                match self.binary(input, &mut will.payload, MAX_WILL_PAYLOAD_LEN)? {
                    Field::Ready => {
                        self.state = self.after_will();
                        self.connect_done_or(Continue)
                    }
                    Field::Pending => Ok(Incomplete),
                    Field::TooLarge(size) => Ok(WantMemory(size)),
                }
            }
            State::ConnectUsername => match self.text(input, MAX_CREDENTIAL_LEN)? {
                Field::Ready => {
                    let mut username = String::new();
                    self.fill(&mut username)?;
                    variant!(message, Connect).username = Some(username);

                    self.state = if self.connect_flags.password {
                        State::ConnectPassword
                    } else {
                        State::Initial
                    };
                    self.connect_done_or(Continue)
                }
                Field::Pending => Ok(Incomplete),
                Field::TooLarge(size) => Ok(WantMemory(size)),
            },
            State::ConnectPassword => {
                let connect = variant!(message, Connect);
                let password = connect.password.get_or_insert_with(Vec::new);

                match self.binary(input, password, MAX_CREDENTIAL_LEN)? {
                    Field::Ready => {
                        self.state = State::Initial;
                        self.connect_done_or(Continue)
                    }
                    Field::Pending => Ok(Incomplete),
                    Field::TooLarge(size) => Ok(WantMemory(size)),
                }
            }
            State::ConnAck => {
                let Some(word) = self.word(input)? else {
                    return Ok(Incomplete);
                };

                let [flags, code] = word.to_be_bytes();
                *message = Message::ConnAck(ConnAck::from_bytes(flags, code)?);
                self.finish()
            }
            State::PublishTopicName => match self.text(input, MAX_TOPIC_LEN)? {
                Field::Ready => {
                    let publish = variant!(message, Publish);
                    self.fill(&mut publish.topic)?;

                    self.state = match publish.flags.qos {
                        QoS::AtMostOnce => State::PublishPayload,
                        _ => State::PublishMessageId,
                    };
                    Ok(Continue)
                }
                Field::Pending => Ok(Incomplete),
                Field::TooLarge(size) => Ok(WantMemory(size)),
            },
            State::PublishMessageId => {
                let Some(id) = self.word(input)? else {
                    return Ok(Incomplete);
                };

                variant!(message, Publish).packet_id = Some(PacketId::try_from(id)?);
                self.state = State::PublishPayload;
                Ok(Continue)
            }
            State::PublishPayload => {
                let publish = variant!(message, Publish);

                if publish.payload.len() + self.remaining > MAX_PAYLOAD_LEN {
                    return Ok(WantMemory(publish.payload.len() + self.remaining));
                }

                let chunk = input.take(self.remaining);
                self.remaining -= chunk.len();
                publish
                    .payload
                    .extend_from_slice(chunk)
                    .map_err(|_| crate::Error::BufferTooSmall)?;

                if self.remaining == 0 {
                    self.state = State::Initial;
                    Ok(Done)
                } else {
                    Ok(Incomplete)
                }
            }
            State::MessageId => {
                let Some(id) = self.word(input)? else {
                    return Ok(Incomplete);
                };

                let id = PacketId::try_from(id)?;
                let header = self.header.ok_or(crate::Error::MalformedPacket)?;
                *message = match header.packet_type {
                    PacketType::PubAck => Message::PubAck(id),
                    PacketType::PubRec => Message::PubRec(id),
                    PacketType::PubRel => Message::PubRel(id),
                    PacketType::PubComp => Message::PubComp(id),
                    PacketType::UnsubAck => Message::UnsubAck(id),
                    _ => return Err(crate::Error::MalformedPacket),
                };
                self.finish()
            }
            State::SubscribeMessageId => {
                let Some(id) = self.word(input)? else {
                    return Ok(Incomplete);
                };

                *message = Message::Subscribe(Subscribe {
                    packet_id: PacketId::try_from(id)?,
                    topics: Vec::new(),
                });
                self.state = State::SubscribeFilter;
                Ok(Continue)
            }
            State::SubscribeFilter => match self.text(input, MAX_TOPIC_LEN)? {
                Field::Ready => {
                    let mut topic_filter = String::new();
                    self.fill(&mut topic_filter)?;
                    variant!(message, Subscribe)
                        .topics
                        .push(Subscription {
                            topic_filter,
                            qos: QoS::AtMostOnce,
                        })
                        .map_err(|_| crate::Error::CapacityExceeded)?;
                    self.state = State::SubscribeQos;
                    Ok(Continue)
                }
                Field::Pending => Ok(Incomplete),
                Field::TooLarge(size) => Ok(WantMemory(size)),
            },
            State::SubscribeQos => {
                let Some(byte) = self.byte(input)? else {
                    return Ok(Incomplete);
                };

                if byte & 0b1111_1100 != 0 {
                    return Err(crate::Error::MalformedPacket);
                }

                let subscription = variant!(message, Subscribe)
                    .topics
                    .last_mut()
                    .ok_or(crate::Error::MalformedPacket)?;
                subscription.qos = QoS::try_from(byte)?;

                if self.remaining == 0 {
                    self.state = State::Initial;
                    Ok(Done)
                } else {
                    self.state = State::SubscribeFilter;
                    Ok(Continue)
                }
            }
            State::SubAckMessageId => {
                let Some(id) = self.word(input)? else {
                    return Ok(Incomplete);
                };

                *message = Message::SubAck(SubAck {
                    packet_id: PacketId::try_from(id)?,
                    return_codes: Vec::new(),
                });
                self.state = State::SubAckCodes;
                Ok(Continue)
            }
            State::SubAckCodes => {
                let Some(byte) = self.byte(input)? else {
                    return Ok(Incomplete);
                };

                variant!(message, SubAck)
                    .return_codes
                    .push(SubAckCode::try_from(byte)?)
                    .map_err(|_| crate::Error::CapacityExceeded)?;

                if self.remaining == 0 {
                    self.state = State::Initial;
                    Ok(Done)
                } else {
                    Ok(Continue)
                }
            }
            State::UnsubscribeMessageId => {
                let Some(id) = self.word(input)? else {
                    return Ok(Incomplete);
                };

                *message = Message::Unsubscribe(Unsubscribe {
                    packet_id: PacketId::try_from(id)?,
                    topics: Vec::new(),
                });
                self.state = State::UnsubscribeFilter;
                Ok(Continue)
            }
            State::UnsubscribeFilter => match self.text(input, MAX_TOPIC_LEN)? {
                Field::Ready => {
                    let mut topic = String::new();
                    self.fill(&mut topic)?;
                    variant!(message, Unsubscribe)
                        .topics
                        .push(topic)
                        .map_err(|_| crate::Error::CapacityExceeded)?;

                    if self.remaining == 0 {
                        self.state = State::Initial;
                        Ok(Done)
                    } else {
                        Ok(Continue)
                    }
                }
                Field::Pending => Ok(Incomplete),
                Field::TooLarge(size) => Ok(WantMemory(size)),
            },
            State::Empty => {
                if self.remaining != 0 {
                    return Err(crate::Error::MalformedPacket);
                }

                let header = self.header.ok_or(crate::Error::MalformedPacket)?;
                *message = match header.packet_type {
                    PacketType::PingReq => Message::PingReq,
                    PacketType::PingResp => Message::PingResp,
                    _ => Message::Disconnect,
                };
                self.state = State::Initial;
                Ok(Done)
            }
            State::Discard => {
                let skipped = input.take(self.remaining).len();
                self.remaining -= skipped;

                if self.remaining == 0 {
                    debug!("discarded rest of packet");
                    self.state = State::Initial;
                    Ok(Continue)
                } else {
                    Ok(Incomplete)
                }
            }
            State::Failed => Err(self.error.unwrap_or(crate::Error::MalformedPacket)),
        }
    }

    fn after_will(&self) -> State {
        if self.connect_flags.username {
            State::ConnectUsername
        } else {
            State::Initial
        }
    }

    /// CONNECT ends once no optional field is left; the body must be used
    /// up exactly at that point.
    fn connect_done_or(&mut self, status: ParseStatus) -> Result<ParseStatus, crate::Error> {
        if self.state != State::Initial {
            return Ok(status);
        }

        if self.remaining != 0 {
            // Still inside the body: skip the rest, the stream stays in sync.
            self.state = State::Discard;
            return Err(crate::Error::MalformedPacket);
        }

        Ok(ParseStatus::Done)
    }

    fn finish(&mut self) -> Result<ParseStatus, crate::Error> {
        if self.remaining != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        self.state = State::Initial;
        Ok(ParseStatus::Done)
    }

    fn byte(&mut self, input: &mut Input) -> Result<Option<u8>, crate::Error> {
        if self.remaining == 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let byte = input.next();
        if byte.is_some() {
            self.remaining -= 1;
        }

        Ok(byte)
    }

    fn word(&mut self, input: &mut Input) -> Result<Option<u16>, crate::Error> {
        loop {
            let Some(byte) = self.byte(input)? else {
                return Ok(None);
            };

            match self.high_byte.take() {
                None => self.high_byte = Some(byte),
                Some(high) => return Ok(Some(u16::from_be_bytes([high, byte]))),
            }
        }
    }

    fn binary<const M: usize>(
        &mut self,
        input: &mut Input,
        dest: &mut Vec<u8, M>,
        limit: usize,
    ) -> Result<Field, crate::Error> {
        let len = match self.field_len {
            Some(len) => len,
            None => {
                let Some(len) = self.word(input)? else {
                    return Ok(Field::Pending);
                };
                let len = len as usize;

                if len > self.remaining {
                    return Err(crate::Error::MalformedPacket);
                }

                if len > limit.min(M) {
                    return Ok(Field::TooLarge(len));
                }

                dest.clear();
                self.field_len = Some(len);
                len
            }
        };

        let chunk = input.take(len - dest.len());
        self.remaining -= chunk.len();
        dest.extend_from_slice(chunk)
            .map_err(|_| crate::Error::BufferTooSmall)?;

        if dest.len() == len {
            self.field_len = None;
            Ok(Field::Ready)
        } else {
            Ok(Field::Pending)
        }
    }

    fn text(&mut self, input: &mut Input, limit: usize) -> Result<Field, crate::Error> {
        let mut scratch = core::mem::take(&mut self.scratch);
        let field = self.binary(input, &mut scratch, limit);
        self.scratch = scratch;
        field
    }

    fn fill<const M: usize>(&self, target: &mut String<M>) -> Result<(), crate::Error> {
        let text = core::str::from_utf8(&self.scratch).map_err(|_| crate::Error::InvalidUtf8)?;

        target.clear();
        target
            .push_str(text)
            .map_err(|_| crate::Error::BufferTooSmall)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        encode::{self, MAX_REMAINING_LENGTH},
        serialize,
    };

    fn encode(message: &Message) -> std::vec::Vec<u8> {
        let mut buf = [0u8; 1024];
        let len = serialize(message, &mut buf).unwrap();
        buf[..len].to_vec()
    }

    fn parse_whole(bytes: &[u8]) -> Message {
        let mut parser = Parser::new();
        let mut message = Message::default();

        assert_eq!(parser.execute(&mut message, bytes), Ok(ParseStatus::Done));
        assert_eq!(parser.consumed(), bytes.len());
        message
    }

    fn full_connect() -> Message {
        Message::Connect(Connect {
            protocol: ProtocolVersion::V311,
            clean_session: false,
            keep_alive: 120,
            client_id: String::try_from("Client 2").unwrap(),
            will: Some(Will {
                topic: String::try_from("topic1").unwrap(),
                payload: Vec::from_slice(b"heavy-load").unwrap(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some(String::try_from("user 1").unwrap()),
            password: Some(Vec::from_slice(b"long-pass").unwrap()),
        })
    }

    fn round_trip_length(value: usize) {
        let mut buf = [0u8; 4];
        let mut cursor = encode::Cursor::new(&mut buf);
        let written = encode::remaining_length(value, &mut cursor).unwrap();
        assert_eq!(written, encode::remaining_length_len(value).unwrap());

        let mut length = RemainingLength::new();
        for (i, byte) in buf[..written].iter().enumerate() {
            let decoded = length.push(*byte).unwrap();
            if i + 1 == written {
                assert_eq!(decoded, Some(value));
            } else {
                assert_eq!(decoded, None);
            }
        }
    }

    #[test]
    fn remaining_length_round_trip() {
        for value in 0..=20_000 {
            round_trip_length(value);
        }

        for boundary in [127, 128, 16_383, 16_384, 2_097_151, 2_097_152, MAX_REMAINING_LENGTH] {
            round_trip_length(boundary);
        }

        let mut value = 0;
        while value <= MAX_REMAINING_LENGTH {
            round_trip_length(value);
            value += 65_537;
        }
    }

    #[test]
    #[ignore = "walks the whole remaining length range"]
    fn remaining_length_round_trip_exhaustive() {
        for value in 0..=MAX_REMAINING_LENGTH {
            round_trip_length(value);
        }
    }

    #[test]
    fn remaining_length_rejects_fifth_byte() {
        let mut length = RemainingLength::new();

        for _ in 0..3 {
            assert_eq!(length.push(0xFF), Ok(None));
        }
        assert_eq!(
            length.push(0xFF),
            Err(crate::Error::MalformedRemainingLength)
        );
    }

    #[test]
    fn connect_resumes_at_every_split() {
        let expected = full_connect();
        let bytes = encode(&expected);
        assert_eq!(parse_whole(&bytes), expected);

        for split in 0..bytes.len() {
            let mut parser = Parser::new();
            let mut message = Message::default();

            let status = parser.execute(&mut message, &bytes[..split]).unwrap();
            assert_eq!(status, ParseStatus::Incomplete, "split at {}", split);
            assert_eq!(parser.consumed(), split);

            let status = parser.execute(&mut message, &bytes[split..]).unwrap();
            assert_eq!(status, ParseStatus::Done, "split at {}", split);
            assert_eq!(parser.consumed(), bytes.len() - split);
            assert_eq!(message, expected, "split at {}", split);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let expected = full_connect();
        let bytes = encode(&expected);
        let mut parser = Parser::new();
        let mut message = Message::default();

        for (i, byte) in bytes.iter().enumerate() {
            let status = parser.execute(&mut message, core::slice::from_ref(byte)).unwrap();
            if i + 1 == bytes.len() {
                assert_eq!(status, ParseStatus::Done);
            } else {
                assert_eq!(status, ParseStatus::Incomplete);
            }
        }

        assert_eq!(message, expected);
    }

    #[test]
    fn rejects_remaining_length_shorter_than_fields() {
        let mut bytes = encode(&full_connect());
        bytes[1] -= 1;

        let mut parser = Parser::new();
        let mut message = Message::default();
        assert_eq!(
            parser.execute(&mut message, &bytes),
            Err(crate::Error::MalformedPacket)
        );
        assert_eq!(parser.last_error(), Some(crate::Error::MalformedPacket));
    }

    #[test]
    fn rejects_remaining_length_longer_than_fields() {
        // PUBACK declaring three bytes of body.
        let bytes = [0x40, 0x03, 0x00, 0x01, 0xFF];

        let mut parser = Parser::new();
        let mut message = Message::default();
        assert_eq!(
            parser.execute(&mut message, &bytes),
            Err(crate::Error::MalformedPacket)
        );
    }

    #[test]
    fn connect_with_trailing_body_is_skipped() {
        let mut bytes = encode(&full_connect());
        let end = bytes.len();
        bytes[1] += 2;
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xD0, 0x00]);

        let mut parser = Parser::new();
        let mut message = Message::default();
        assert_eq!(
            parser.execute(&mut message, &bytes),
            Err(crate::Error::MalformedPacket)
        );
        assert_eq!(parser.consumed(), end);

        assert_eq!(
            parser.execute(&mut message, &bytes[end..]),
            Ok(ParseStatus::Done)
        );
        assert_eq!(message, Message::PingResp);
    }

    #[test]
    fn publish_payload_stops_at_remaining_length() {
        let mut bytes = std::vec![0x30, 7, 0x00, 0x03, b'a', b'/', b'b'];
        bytes.extend_from_slice(b"hi");
        // Start of the next packet.
        bytes.extend_from_slice(&[0xD0, 0x00]);

        let mut parser = Parser::new();
        let mut message = Message::default();

        assert_eq!(parser.execute(&mut message, &bytes), Ok(ParseStatus::Done));
        assert_eq!(parser.consumed(), 9);

        let Message::Publish(publish) = &message else {
            panic!("expected publish, got {:?}", message);
        };
        assert_eq!(publish.topic, "a/b");
        assert_eq!(publish.payload, b"hi".as_slice());
        assert_eq!(publish.packet_id, None);

        assert_eq!(
            parser.execute(&mut message, &bytes[9..]),
            Ok(ParseStatus::Done)
        );
        assert_eq!(message, Message::PingResp);
    }

    #[test]
    fn parses_qos2_publish() {
        let mut publish = Publish::new("sensors/temp", b"99", QoS::ExactlyOnce).unwrap();
        publish.packet_id = Some(PacketId(42));
        publish.flags.dup = true;
        let expected = Message::Publish(publish);

        assert_eq!(parse_whole(&encode(&expected)), expected);
    }

    #[test]
    fn parses_acks_and_subscriptions() {
        let messages = [
            Message::ConnAck(ConnAck::from_bytes(1, 0).unwrap()),
            Message::PubAck(PacketId(1)),
            Message::PubRec(PacketId(2)),
            Message::PubRel(PacketId(3)),
            Message::PubComp(PacketId(4)),
            Message::UnsubAck(PacketId(5)),
            Message::Subscribe(Subscribe::single(PacketId(6), "sensors/#", QoS::AtLeastOnce).unwrap()),
            Message::Unsubscribe(Unsubscribe::single(PacketId(7), "sensors/#").unwrap()),
            Message::SubAck(SubAck {
                packet_id: PacketId(8),
                return_codes: Vec::from_slice(&[SubAckCode::Granted(QoS::AtLeastOnce), SubAckCode::Failure])
                    .unwrap(),
            }),
            Message::PingReq,
            Message::PingResp,
            Message::Disconnect,
        ];

        for message in messages {
            assert_eq!(parse_whole(&encode(&message)), message);
        }
    }

    #[test]
    fn oversized_field_can_be_discarded() {
        let topic = [b'x'; MAX_TOPIC_LEN + 1];
        // Remaining length 131: topic length prefix plus 129 topic bytes.
        let mut bytes = std::vec![0x30, 0x83, 0x01, 0x00, (MAX_TOPIC_LEN + 1) as u8];
        bytes.extend_from_slice(&topic);
        bytes.extend_from_slice(&[0xC0, 0x00]);

        let mut parser = Parser::new();
        let mut message = Message::default();

        let status = parser.execute(&mut message, &bytes).unwrap();
        assert_eq!(status, ParseStatus::WantMemory(MAX_TOPIC_LEN + 1));
        let mut offset = parser.consumed();

        // Stays blocked until told to drop the packet.
        assert_eq!(
            parser.execute(&mut message, &bytes[offset..]),
            Ok(ParseStatus::WantMemory(MAX_TOPIC_LEN + 1))
        );
        assert_eq!(parser.consumed(), 0);

        parser.discard();
        assert_eq!(
            parser.execute(&mut message, &bytes[offset..]),
            Ok(ParseStatus::Done)
        );
        offset += parser.consumed();
        assert_eq!(offset, bytes.len());
        assert_eq!(message, Message::PingReq);
    }

    #[test]
    fn body_error_skips_to_next_packet() {
        // CONNACK with reserved flag bits set, then a PINGRESP.
        let bytes = [0x20, 0x02, 0x02, 0x00, 0xD0, 0x00];

        let mut parser = Parser::new();
        let mut message = Message::default();

        assert_eq!(
            parser.execute(&mut message, &bytes),
            Err(crate::Error::MalformedPacket)
        );
        let offset = parser.consumed();

        assert_eq!(
            parser.execute(&mut message, &bytes[offset..]),
            Ok(ParseStatus::Done)
        );
        assert_eq!(message, Message::PingResp);
    }

    #[test]
    fn header_error_is_sticky() {
        let mut parser = Parser::new();
        let mut message = Message::default();

        assert_eq!(
            parser.execute(&mut message, &[0x00, 0x00]),
            Err(crate::Error::InvalidPacketType)
        );
        assert_eq!(
            parser.execute(&mut message, &[0xD0, 0x00]),
            Err(crate::Error::InvalidPacketType)
        );

        parser.reset();
        assert_eq!(
            parser.execute(&mut message, &[0xD0, 0x00]),
            Ok(ParseStatus::Done)
        );
    }

    #[test]
    fn mqtt31_connect() {
        let expected = Message::Connect(Connect {
            protocol: ProtocolVersion::V31,
            clean_session: true,
            keep_alive: 30,
            client_id: String::try_from("test_client").unwrap(),
            ..Default::default()
        });

        assert_eq!(parse_whole(&encode(&expected)), expected);
    }

    #[test]
    fn single_step_returns_continue() {
        let mut parser = Parser::new();
        let mut message = Message::default();

        assert_eq!(
            parser.step(&mut message, &[0xC0, 0x00]),
            Ok(ParseStatus::Continue)
        );
        assert_eq!(parser.consumed(), 1);
    }
}
