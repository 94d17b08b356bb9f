//! External representation of entries and the welcome record. Everything on
//! the wire is big-endian.
//!
//! ```text
//! welcome := u8 identifier  u64 lastSeenTimestamp
//! record  := u16 length  length bytes payload      (length == 0 is a heartbeat)
//! payload := u16 keyLen  keyLen*u8 key
//!            u8 flags (bit 0 = has-value)
//!            [ u32 valueLen  valueLen*u8 value ]
//!            u64 timestamp
//!            u8 modifierIdentifier
//! ```

use std::io;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use ember::{valid_peer_id, PeerId};

use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use crate::store::Entry;

/// Length prefix in front of every record on the reliable stream.
pub const RECORD_HEADER_SIZE: usize = 2;

/// Size of the welcome, the first bytes either side sends.
pub const WELCOME_SIZE: usize = 9;

const FLAG_HAS_VALUE: u8 = 0b0000_0001;

/// Serializes the welcome record.
pub fn write_welcome<W: io::Write>(
    stream: &mut W,
    identifier: PeerId,
    last_seen: u64,
) -> io::Result<()> {
    stream.write_u8(identifier)?;
    stream.write_u64::<BigEndian>(last_seen)
}

/// Parses a welcome from the front of `buffer`. `Wait` until all
/// `WELCOME_SIZE` bytes are present; `HandshakeRejected` for an identifier
/// outside the valid range.
pub fn read_welcome(buffer: &[u8]) -> NetworkResult<(PeerId, u64)> {
    if buffer.len() < WELCOME_SIZE {
        return Err(NetworkError::Wait);
    }

    let identifier = buffer[0];
    let last_seen = BigEndian::read_u64(&buffer[1..WELCOME_SIZE]);

    if !valid_peer_id(identifier) {
        return Err(NetworkError::Fatal(ErrorType::HandshakeRejected));
    }

    Ok((identifier, last_seen))
}

/// Serializes one entry into the stream. The caller frames the result with
/// a record length prefix.
pub fn write_entry<W: io::Write>(stream: &mut W, entry: &Entry) -> io::Result<()> {
    stream.write_u16::<BigEndian>(entry.key.len() as u16)?;
    stream.write_all(&entry.key)?;

    match &entry.value {
        Some(value) => {
            stream.write_u8(FLAG_HAS_VALUE)?;
            stream.write_u32::<BigEndian>(value.len() as u32)?;
            stream.write_all(value)?;
        }
        None => stream.write_u8(0)?,
    }

    stream.write_u64::<BigEndian>(entry.timestamp)?;
    stream.write_u8(entry.modifier)
}

/// Deserializes one entry from a complete record payload. Any length
/// running past the frame, unknown flag bits, trailing bytes, or an invalid
/// modifier identifier are `Malformed`.
pub fn read_entry(frame: &[u8]) -> NetworkResult<Entry> {
    const MALFORMED: NetworkError = NetworkError::Fatal(ErrorType::Malformed);

    if frame.len() < 2 {
        return Err(MALFORMED);
    }

    let key_len = BigEndian::read_u16(&frame[..2]) as usize;
    let mut at = 2;

    if frame.len() < at + key_len + 1 {
        return Err(MALFORMED);
    }

    let key: Box<[u8]> = frame[at..at + key_len].into();
    at += key_len;

    let flags = frame[at];
    at += 1;

    if flags & !FLAG_HAS_VALUE != 0 {
        return Err(MALFORMED);
    }

    let value = if flags & FLAG_HAS_VALUE != 0 {
        if frame.len() < at + 4 {
            return Err(MALFORMED);
        }

        let value_len = BigEndian::read_u32(&frame[at..at + 4]) as usize;
        at += 4;

        if frame.len() < at + value_len {
            return Err(MALFORMED);
        }

        let value: Box<[u8]> = frame[at..at + value_len].into();
        at += value_len;

        Some(value)
    } else {
        None
    };

    // Exactly the timestamp and modifier must remain.
    if frame.len() != at + 9 {
        return Err(MALFORMED);
    }

    let timestamp = BigEndian::read_u64(&frame[at..at + 8]);
    let modifier = frame[at + 8];

    if !valid_peer_id(modifier) {
        return Err(MALFORMED);
    }

    Ok(Entry {
        key,
        value,
        timestamp,
        modifier,
    })
}
