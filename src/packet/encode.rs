use crate::protocol;

/// Largest value the four-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

pub(crate) trait EncodePacket {
    const PACKET_TYPE: protocol::PacketType;
    fn flags(&self) -> u8;
    fn required_space(&self) -> usize;
    fn encode_body(&self, cursor: &mut Cursor) -> Result<(), crate::Error>;
}

pub(crate) trait Encode {
    fn encode(&self, cursor: &mut Cursor) -> Result<(), crate::Error>;
    fn required_space(&self) -> usize;
}

pub fn remaining_length_len(len: usize) -> Result<usize, crate::Error> {
    match len {
        0..=127 => Ok(1),
        128..=16_383 => Ok(2),
        16_384..=2_097_151 => Ok(3),
        2_097_152..=MAX_REMAINING_LENGTH => Ok(4),
        _ => Err(crate::Error::MalformedRemainingLength),
    }
}

pub(crate) fn remaining_length(mut len: usize, cursor: &mut Cursor) -> Result<usize, crate::Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(crate::Error::MalformedRemainingLength);
    }

    let mut written = 0;

    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;

        if len > 0 {
            byte |= 0x80;
        }

        cursor.write_u8(byte)?;
        written += 1;

        if len == 0 {
            return Ok(written);
        }
    }
}

pub struct Cursor<'buf> {
    buf: &'buf mut [u8],
    pos: usize,
}

impl<'buf> Cursor<'buf> {
    pub const fn new(buf: &'buf mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn write_u8(&mut self, byte: u8) -> Result<(), crate::Error> {
        self.ensure_remaining(1)?;
        self.buf[self.pos] = byte;
        self.pos += 1;

        Ok(())
    }

    pub(crate) fn write_u16(&mut self, value: u16) -> Result<(), crate::Error> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), crate::Error> {
        let len = bytes.len();
        self.ensure_remaining(len)?;

        self.buf[self.pos..self.pos + len].copy_from_slice(bytes);
        self.pos += len;

        Ok(())
    }

    pub(crate) fn write_binary_chunk(&mut self, bytes: &[u8]) -> Result<(), crate::Error> {
        let len = u16::try_from(bytes.len()).map_err(|_| crate::Error::MalformedPacket)?;
        self.write_u16(len)?;
        self.write_bytes(bytes)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure_remaining(&self, n: usize) -> Result<(), crate::Error> {
        if self.remaining() < n {
            Err(crate::Error::BufferTooSmall)
        } else {
            Ok(())
        }
    }
}

impl Encode for u16 {
    fn encode(&self, cursor: &mut Cursor) -> Result<(), crate::Error> {
        cursor.write_u16(*self)
    }

    fn required_space(&self) -> usize {
        2
    }
}

impl Encode for u8 {
    fn encode(&self, cursor: &mut Cursor) -> Result<(), crate::Error> {
        cursor.write_u8(*self)
    }

    fn required_space(&self) -> usize {
        1
    }
}

impl Encode for str {
    fn encode(&self, cursor: &mut Cursor) -> Result<(), crate::Error> {
        cursor.write_binary_chunk(self.as_bytes())
    }

    fn required_space(&self) -> usize {
        self.len() + 2
    }
}

impl Encode for [u8] {
    fn encode(&self, cursor: &mut Cursor) -> Result<(), crate::Error> {
        cursor.write_binary_chunk(self)
    }

    fn required_space(&self) -> usize {
        self.len() + 2
    }
}

pub(crate) fn encode_packet<P: EncodePacket>(
    packet: &P,
    cursor: &mut Cursor<'_>,
) -> Result<(), crate::Error> {
    let header = ((P::PACKET_TYPE as u8) << 4) | (packet.flags() & 0x0F);
    cursor.write_u8(header)?;

    remaining_length(packet.required_space(), cursor)?;

    packet.encode_body(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(len: usize) -> ([u8; 4], usize) {
        let mut buf = [0u8; 4];
        let mut cursor = Cursor::new(&mut buf);
        let written = remaining_length(len, &mut cursor).unwrap();
        (buf, written)
    }

    #[test]
    fn remaining_length_boundaries() {
        assert_eq!(encoded(0), ([0x00, 0, 0, 0], 1));
        assert_eq!(encoded(127), ([0x7F, 0, 0, 0], 1));
        assert_eq!(encoded(128), ([0x80, 0x01, 0, 0], 2));
        assert_eq!(encoded(16_383), ([0xFF, 0x7F, 0, 0], 2));
        assert_eq!(encoded(16_384), ([0x80, 0x80, 0x01, 0], 3));
        assert_eq!(encoded(2_097_151), ([0xFF, 0xFF, 0x7F, 0], 3));
        assert_eq!(encoded(2_097_152), ([0x80, 0x80, 0x80, 0x01], 4));
        assert_eq!(encoded(MAX_REMAINING_LENGTH), ([0xFF, 0xFF, 0xFF, 0x7F], 4));
    }

    #[test]
    fn remaining_length_too_large() {
        let mut buf = [0u8; 8];
        let mut cursor = Cursor::new(&mut buf);

        assert_eq!(
            remaining_length(MAX_REMAINING_LENGTH + 1, &mut cursor),
            Err(crate::Error::MalformedRemainingLength)
        );
        assert_eq!(
            remaining_length_len(MAX_REMAINING_LENGTH + 1),
            Err(crate::Error::MalformedRemainingLength)
        );
    }

    #[test]
    fn cursor_refuses_overflow() {
        let mut buf = [0u8; 3];
        let mut cursor = Cursor::new(&mut buf);

        assert_eq!(
            "abc".encode(&mut cursor),
            Err(crate::Error::BufferTooSmall)
        );

        let mut cursor = Cursor::new(&mut buf);
        "a".encode(&mut cursor).unwrap();
        assert_eq!(cursor.written(), &[0x00, 0x01, b'a']);
    }
}
