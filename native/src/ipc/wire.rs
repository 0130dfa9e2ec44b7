// Byte-level framing for the control channel: interruption-safe full reads
// and writes, and the fixed-size message header.

use std::io::{ErrorKind, Read, Write};

use crate::error::{CommError, CommResult};

/// Number of 32-bit words in the header body.
pub const HEADER_WORDS: usize = 7;

/// Header size on the wire: discriminant plus a body sized for the largest
/// fixed-shape message.
pub const HEADER_SIZE: usize = 4 + HEADER_WORDS * 4;

/// Length value meaning "no value" for strings and blobs.
pub const NULL_LEN: i32 = -1;

/// Fill `buf` completely. Interrupted reads are retried; EOF before the end is
/// `PeerGone` and the partial bytes are never handed out.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> CommResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(CommError::PeerGone {
                    transferred: filled,
                    expected: buf.len(),
                })
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Write all of `buf`. Interrupted writes are retried; a broken pipe is not,
/// since the peer is on its way out and looping would hang.
pub fn write_full<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> CommResult<()> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(CommError::PeerGone {
                    transferred: written,
                    expected: buf.len(),
                })
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == ErrorKind::BrokenPipe => return Err(CommError::BrokenPipe),
            Err(e) => return Err(e.into()),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == ErrorKind::BrokenPipe => return Err(CommError::BrokenPipe),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Fixed-size header: a discriminant followed by seven little-endian words.
/// A 64-bit value spans two consecutive words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub discriminant: u32,
    words: [i32; HEADER_WORDS],
}

impl Header {
    pub fn new(discriminant: u32) -> Self {
        Self {
            discriminant,
            words: [0; HEADER_WORDS],
        }
    }

    pub fn word(&self, index: usize) -> i32 {
        self.words[index]
    }

    pub fn set_word(&mut self, index: usize, value: i32) -> &mut Self {
        self.words[index] = value;
        self
    }

    pub fn long(&self, index: usize) -> i64 {
        let lo = self.words[index] as u32 as u64;
        let hi = self.words[index + 1] as u32 as u64;
        (lo | (hi << 32)) as i64
    }

    pub fn set_long(&mut self, index: usize, value: i64) -> &mut Self {
        let bits = value as u64;
        self.words[index] = bits as u32 as i32;
        self.words[index + 1] = (bits >> 32) as u32 as i32;
        self
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.discriminant.to_le_bytes());
        for (i, word) in self.words.iter().enumerate() {
            out[4 + i * 4..8 + i * 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut header = Header::new(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        for i in 0..HEADER_WORDS {
            let at = 4 + i * 4;
            header.words[i] =
                i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        header
    }

    /// Read one header, retrying interruptions.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> CommResult<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        read_full(reader, &mut bytes)?;
        Ok(Self::from_bytes(&bytes))
    }
}

/// Validate a length taken off the wire. `-1` is NULL, anything else must be
/// within `0..=max`.
pub fn checked_len(raw: i64, max: usize) -> CommResult<Option<usize>> {
    if raw == NULL_LEN as i64 {
        return Ok(None);
    }
    if raw < 0 || raw as u64 > max as u64 {
        return Err(CommError::Malformed(format!(
            "length {} outside -1..={}",
            raw, max
        )));
    }
    Ok(Some(raw as usize))
}

/// Read `len` bytes of string data. No terminator travels on the wire.
pub fn read_string<R: Read + ?Sized>(reader: &mut R, len: Option<usize>) -> CommResult<Option<String>> {
    match read_bytes(reader, len)? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| CommError::Malformed("string is not valid UTF-8".to_string())),
    }
}

pub fn read_bytes<R: Read + ?Sized>(reader: &mut R, len: Option<usize>) -> CommResult<Option<Vec<u8>>> {
    match len {
        None => Ok(None),
        Some(len) => {
            let mut bytes = vec![0u8; len];
            read_full(reader, &mut bytes)?;
            Ok(Some(bytes))
        }
    }
}

/// Wire length of an optional string or blob.
pub fn wire_len(data: Option<&[u8]>, max: usize) -> CommResult<i64> {
    match data {
        None => Ok(NULL_LEN as i64),
        Some(bytes) if bytes.len() <= max && bytes.len() <= i32::MAX as usize => {
            Ok(bytes.len() as i64)
        }
        Some(bytes) => Err(CommError::Malformed(format!(
            "{} bytes exceed the {} byte message limit",
            bytes.len(),
            max
        ))),
    }
}
