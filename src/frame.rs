use crate::connection::Role;
use crate::error::{Error, ProtocolError};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other).into()),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// A decoded frame header, everything on the wire before the payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload_len: u64,
    /// Only meaningful when `masked` is set.
    pub mask_key: [u8; 4],
}

impl FrameHeader {
    pub(crate) fn new(fin: bool, rsv1: bool, opcode: OpCode, payload_len: u64) -> FrameHeader {
        FrameHeader {
            fin,
            rsv1,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            payload_len,
            mask_key: [0; 4],
        }
    }

    /// The mask key, when the frame is masked.
    pub(crate) fn mask(&self) -> Option<[u8; 4]> {
        self.masked.then_some(self.mask_key)
    }

    /// Reads and validates one frame header.
    ///
    /// The first bit of the first byte tells us whether this frame is the
    /// final fragment of a message, the next three are the reserved bits, and
    /// the low nibble is the opcode. The second byte carries the mask bit and
    /// the 7-bit length, which may spill into a 16-bit or 64-bit extension.
    pub(crate) async fn read_from<R>(
        reader: &mut R,
        role: Role,
        deflate_negotiated: bool,
    ) -> Result<FrameHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 2];
        reader.read_exact(&mut header).await?;

        let fin = (header[0] & 0b1000_0000) != 0;
        let rsv1 = (header[0] & 0b0100_0000) != 0;
        let rsv2 = (header[0] & 0b0010_0000) != 0;
        let rsv3 = (header[0] & 0b0001_0000) != 0;
        let opcode = OpCode::from_u8(header[0] & 0b0000_1111)?;

        // The base protocol never sets the reserved bits. RSV1 is claimed by
        // permessage-deflate to flag a compressed message, and is only legal
        // on the opening frame of a data message once that was negotiated.
        if rsv2 || rsv3 {
            return Err(ProtocolError::RsvNotZero.into());
        }
        if rsv1 {
            if !deflate_negotiated {
                return Err(ProtocolError::CompressionNotNegotiated.into());
            }
            if !opcode.is_data() {
                return Err(ProtocolError::RsvNotZero.into());
            }
        }

        if opcode.is_control() && !fin {
            return Err(ProtocolError::ControlFrameFragmented.into());
        }

        let masked = (header[1] & 0b1000_0000) != 0;
        let length7 = header[1] & 0b0111_1111;

        // Clients always mask, servers never do. Each side checks the peer.
        match role {
            Role::Server if !masked => return Err(ProtocolError::ExpectedMaskedFrame.into()),
            Role::Client if masked => return Err(ProtocolError::UnexpectedMaskedFrame.into()),
            _ => {}
        }

        if opcode.is_control() && length7 > 125 {
            return Err(ProtocolError::ControlFramePayloadSize.into());
        }

        let payload_len = match length7 {
            126 => {
                let mut be_bytes = [0u8; 2];
                reader.read_exact(&mut be_bytes).await?;
                u16::from_be_bytes(be_bytes) as u64
            }
            127 => {
                let mut be_bytes = [0u8; 8];
                reader.read_exact(&mut be_bytes).await?;
                let len = u64::from_be_bytes(be_bytes);
                if len & (1 << 63) != 0 {
                    return Err(ProtocolError::InvalidPayloadLength.into());
                }
                len
            }
            short => short as u64,
        };

        let mut mask_key = [0u8; 4];
        if masked {
            reader.read_exact(&mut mask_key).await?;
        }

        Ok(FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            payload_len,
            mask_key,
        })
    }

    /// Appends the wire encoding of this header to `dst`, always picking the
    /// smallest of the three length forms.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let mut first = self.opcode.as_u8();
        if self.fin {
            first |= 0b1000_0000;
        }
        if self.rsv1 {
            first |= 0b0100_0000;
        }
        if self.rsv2 {
            first |= 0b0010_0000;
        }
        if self.rsv3 {
            first |= 0b0001_0000;
        }
        dst.put_u8(first);

        let mask_bit = if self.masked { 0b1000_0000 } else { 0 };
        if self.payload_len <= 125 {
            dst.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= u16::MAX as u64 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(self.payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(self.payload_len);
        }

        if self.masked {
            dst.put_slice(&self.mask_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8], role: Role, deflate: bool) -> Result<FrameHeader, Error> {
        let mut slice = bytes;
        FrameHeader::read_from(&mut slice, role, deflate).await
    }

    fn masked(mut header: FrameHeader) -> FrameHeader {
        header.masked = true;
        header.mask_key = [1, 2, 3, 4];
        header
    }

    #[tokio::test]
    async fn round_trips_well_formed_headers() {
        let samples = [
            FrameHeader::new(true, false, OpCode::Text, 0),
            FrameHeader::new(false, false, OpCode::Binary, 125),
            FrameHeader::new(true, true, OpCode::Text, 126),
            FrameHeader::new(true, false, OpCode::Continue, 70_000),
            FrameHeader::new(true, false, OpCode::Ping, 125),
            FrameHeader::new(true, false, OpCode::Close, 2),
        ];
        for header in samples {
            let mut dst = BytesMut::new();
            header.encode(&mut dst);
            let decoded = decode(&dst, Role::Client, true).await.unwrap();
            assert_eq!(decoded, header);

            let mut dst = BytesMut::new();
            masked(header).encode(&mut dst);
            let decoded = decode(&dst, Role::Server, true).await.unwrap();
            assert_eq!(decoded, masked(header));
        }
    }

    #[tokio::test]
    async fn length_encodings_pick_the_smallest_form() {
        // Payload length to expected total header size (unmasked).
        let cases = [
            (125u64, 2usize),
            (126, 4),
            (127, 4),
            (65_535, 4),
            (65_536, 10),
            (1 << 31, 10),
        ];
        for (len, expected) in cases {
            let mut dst = BytesMut::new();
            FrameHeader::new(true, false, OpCode::Binary, len).encode(&mut dst);
            assert_eq!(dst.len(), expected, "len={len}");
            let decoded = decode(&dst, Role::Client, false).await.unwrap();
            assert_eq!(decoded.payload_len, len);
        }
    }

    #[tokio::test]
    async fn rejects_unknown_opcode() {
        assert!(matches!(
            decode(&[0x83, 0x00], Role::Client, false).await,
            Err(Error::Protocol(ProtocolError::InvalidOpcode(0x3)))
        ));
    }

    #[tokio::test]
    async fn rejects_reserved_bits() {
        // RSV2
        assert!(matches!(
            decode(&[0xa1, 0x00], Role::Client, true).await,
            Err(Error::Protocol(ProtocolError::RsvNotZero))
        ));
        // RSV1 without the extension negotiated
        assert!(matches!(
            decode(&[0xc1, 0x00], Role::Client, false).await,
            Err(Error::Protocol(ProtocolError::CompressionNotNegotiated))
        ));
        // RSV1 on a control frame even with the extension negotiated
        assert!(matches!(
            decode(&[0xc9, 0x00], Role::Client, true).await,
            Err(Error::Protocol(ProtocolError::RsvNotZero))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_control_frames() {
        // Fragmented ping
        assert!(matches!(
            decode(&[0x09, 0x00], Role::Client, false).await,
            Err(Error::Protocol(ProtocolError::ControlFrameFragmented))
        ));
        // Oversized close
        assert!(matches!(
            decode(&[0x88, 0x7e], Role::Client, false).await,
            Err(Error::Protocol(ProtocolError::ControlFramePayloadSize))
        ));
    }

    #[tokio::test]
    async fn enforces_masking_direction() {
        let mut dst = BytesMut::new();
        FrameHeader::new(true, false, OpCode::Text, 3).encode(&mut dst);
        assert!(matches!(
            decode(&dst, Role::Server, false).await,
            Err(Error::Protocol(ProtocolError::ExpectedMaskedFrame))
        ));

        let mut dst = BytesMut::new();
        masked(FrameHeader::new(true, false, OpCode::Text, 3)).encode(&mut dst);
        assert!(matches!(
            decode(&dst, Role::Client, false).await,
            Err(Error::Protocol(ProtocolError::UnexpectedMaskedFrame))
        ));
    }

    #[tokio::test]
    async fn rejects_64bit_length_with_msb_set() {
        let mut bytes = vec![0x82, 0x7f];
        bytes.extend_from_slice(&(1u64 << 63 | 42).to_be_bytes());
        assert!(matches!(
            decode(&bytes, Role::Client, false).await,
            Err(Error::Protocol(ProtocolError::InvalidPayloadLength))
        ));
    }
}
