//! Bit-level decoding of IPv4 and TCP headers out of raw captured frames.
//!
//! Decoding threads an immutable [`Cursor`] through every read: each read
//! returns the value together with the cursor positioned after it.

use std::net::Ipv4Addr;

use log::debug;

pub const IPV4_VERSION: u8 = 4;
pub const IP_PROTOCOL_TCP: u8 = 6;
/// Smallest legal IPv4 header, in 32-bit words.
pub const MIN_IPV4_HEADER_WORDS: u8 = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: needed {needed} bytes at offset {offset}, frame has {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("not an IPv4 frame (version {0})")]
    NotIpv4(u8),

    #[error("IPv4 header length of {0} words is below the minimum")]
    BadHeaderLength(u8),

    #[error("cannot read {0} bytes into a 32-bit value")]
    ReadTooWide(usize),
}

/// Widest value [`Cursor::read_bytes`] can return, in bytes.
pub const MAX_READ_BYTES: usize = 4;

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Read position inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::at(buf, 0)
    }

    pub fn at(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&self, n: usize) -> DecodeResult<&'a [u8]> {
        self.buf
            .get(self.offset..self.offset + n)
            .ok_or(DecodeError::Truncated {
                offset: self.offset,
                needed: n,
                len: self.buf.len(),
            })
    }

    /// Reads `n` (at most [`MAX_READ_BYTES`]) bytes as one big-endian value.
    pub fn read_bytes(self, n: usize) -> DecodeResult<(u32, Self)> {
        if n > MAX_READ_BYTES {
            return Err(DecodeError::ReadTooWide(n));
        }
        let value = self
            .take(n)?
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        Ok((value, Self::at(self.buf, self.offset + n)))
    }

    pub fn read_u8(self) -> DecodeResult<(u8, Self)> {
        let (v, next) = self.read_bytes(1)?;
        Ok((v as u8, next))
    }

    pub fn read_u16(self) -> DecodeResult<(u16, Self)> {
        let (v, next) = self.read_bytes(2)?;
        Ok((v as u16, next))
    }

    pub fn read_u32(self) -> DecodeResult<(u32, Self)> {
        self.read_bytes(4)
    }

    /// Upper four bits of the current byte. The cursor stays on that byte.
    pub fn read_high_nibble(self) -> DecodeResult<(u8, Self)> {
        Ok((self.take(1)?[0] >> 4, self))
    }

    /// Lower four bits of the current byte, moving past it.
    pub fn read_low_nibble(self) -> DecodeResult<(u8, Self)> {
        let (byte, next) = self.read_u8()?;
        Ok((byte & 0x0f, next))
    }

    fn read_ipv4_addr(self) -> DecodeResult<(Ipv4Addr, Self)> {
        let (a, cur) = self.read_u8()?;
        let (b, cur) = cur.read_u8()?;
        let (c, cur) = cur.read_u8()?;
        let (d, cur) = cur.read_u8()?;
        Ok((Ipv4Addr::new(a, b, c, d), cur))
    }
}

/// Splits a packed value into `(high, low)` where `low` holds the `low_bits` least
/// significant bits. With `low_bits >= 32` everything lands in `low`.
pub fn split(value: u32, low_bits: u32) -> (u32, u32) {
    match value.checked_shr(low_bits) {
        Some(high) => (high, value - (high << low_bits)),
        None => (0, value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// In 32-bit words.
    pub header_length: u8,
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    pub fn header_len_bytes(&self) -> usize {
        usize::from(self.header_length) * 4
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == IP_PROTOCOL_TCP
    }
}

/// Fixed part of a TCP header.
///
/// Options are not decoded, and `header_length` is reported as sent without
/// being checked against the bytes actually read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    /// In 32-bit words.
    pub header_length: u8,
    pub reserved: u8,
    pub nonce: u8,
    pub flags: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

pub fn decode_ipv4_header(buf: &[u8]) -> DecodeResult<Ipv4Header> {
    let cur = Cursor::new(buf);

    let (b, cur) = cur.read_bytes(1)?;
    let (version, header_length) = split(b, 4);
    let (b, cur) = cur.read_bytes(1)?;
    let (dscp, ecn) = split(b, 2);
    let (total_length, cur) = cur.read_u16()?;
    let (identification, cur) = cur.read_u16()?;
    let (b, cur) = cur.read_bytes(2)?;
    let (flags, fragment_offset) = split(b, 13);
    let (ttl, cur) = cur.read_u8()?;
    let (protocol, cur) = cur.read_u8()?;
    let (checksum, cur) = cur.read_u16()?;
    let (source, cur) = cur.read_ipv4_addr()?;
    let (destination, _) = cur.read_ipv4_addr()?;

    let (version, header_length) = (version as u8, header_length as u8);
    if version != IPV4_VERSION {
        return Err(DecodeError::NotIpv4(version));
    }
    if header_length < MIN_IPV4_HEADER_WORDS {
        return Err(DecodeError::BadHeaderLength(header_length));
    }

    Ok(Ipv4Header {
        version,
        header_length,
        dscp: dscp as u8,
        ecn: ecn as u8,
        total_length,
        identification,
        flags: flags as u8,
        fragment_offset: fragment_offset as u16,
        ttl,
        protocol,
        checksum,
        source,
        destination,
    })
}

/// Decodes the TCP header starting at `offset` (the end of the IPv4 header).
pub fn decode_tcp_header(buf: &[u8], offset: usize) -> DecodeResult<TcpHeader> {
    let cur = Cursor::at(buf, offset);

    let (source_port, cur) = cur.read_u16()?;
    let (destination_port, cur) = cur.read_u16()?;
    let (sequence_number, cur) = cur.read_u32()?;
    let (acknowledgment_number, cur) = cur.read_u32()?;
    let (header_length, cur) = cur.read_high_nibble()?;
    let (low, cur) = cur.read_low_nibble()?;
    let (reserved, nonce) = split(low.into(), 1);
    let (flags, cur) = cur.read_u8()?;
    let (window_size, cur) = cur.read_u16()?;
    let (checksum, cur) = cur.read_u16()?;
    let (urgent_pointer, _) = cur.read_u16()?;

    Ok(TcpHeader {
        source_port,
        destination_port,
        sequence_number,
        acknowledgment_number,
        header_length,
        reserved: reserved as u8,
        nonce: nonce as u8,
        flags,
        window_size,
        checksum,
        urgent_pointer,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket {
    pub ip: Ipv4Header,
    /// Present when the IPv4 protocol field says TCP.
    pub tcp: Option<TcpHeader>,
}

/// Decodes one frame, remembering the result.
pub struct PacketDecoder<'a> {
    frame: &'a [u8],
    decoded: Option<DecodedPacket>,
}

impl<'a> PacketDecoder<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        Self {
            frame,
            decoded: None,
        }
    }

    pub fn decode(&mut self) -> DecodeResult<DecodedPacket> {
        if let Some(decoded) = self.decoded {
            debug!("packet already decoded");
            return Ok(decoded);
        }
        let ip = decode_ipv4_header(self.frame)?;
        let tcp = if ip.is_tcp() {
            Some(decode_tcp_header(self.frame, ip.header_len_bytes())?)
        } else {
            None
        };
        let decoded = DecodedPacket { ip, tcp };
        self.decoded = Some(decoded);
        Ok(decoded)
    }

    /// The cached result, if [`decode`](Self::decode) has succeeded before.
    pub fn decoded(&self) -> Option<&DecodedPacket> {
        self.decoded.as_ref()
    }
}
