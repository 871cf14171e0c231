//! Synchronous framing for the bus: a length-prefixed topic tag followed by
//! a length-prefixed JSON payload.
//!
//! This is the blocking-I/O equivalent of the teacher's `KlipperCodec`
//! (`tokio_util::codec::{Encoder, Decoder}`); threads here suspend at
//! `read`/`write` directly rather than polling a `Sink`/`Stream`, per the
//! OS-thread concurrency model.

use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::UhcError;

const MAX_TOPIC_LEN: usize = 16;
const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Writes one frame: `[topic_len: u8][topic bytes][payload_len: u32 BE][json bytes]`.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, topic: &str, payload: &T) -> Result<(), UhcError> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(UhcError::Codec(format!("topic {topic:?} exceeds {MAX_TOPIC_LEN} bytes")));
    }
    let body = serde_json::to_vec(payload)?;
    if body.len() as u32 > MAX_PAYLOAD_LEN {
        return Err(UhcError::Codec(format!("payload of {} bytes exceeds frame limit", body.len())));
    }

    writer.write_all(&[topic.len() as u8])?;
    writer.write_all(topic.as_bytes())?;
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Blocks until one full frame arrives, returning the topic tag and raw
/// payload bytes. The caller dispatches on the topic to pick a
/// deserialization target.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(String, Vec<u8>), UhcError> {
    let mut topic_len = [0u8; 1];
    reader.read_exact(&mut topic_len)?;
    let topic_len = topic_len[0] as usize;
    if topic_len > MAX_TOPIC_LEN {
        return Err(UhcError::Codec(format!("topic length {topic_len} exceeds {MAX_TOPIC_LEN}")));
    }

    let mut topic_bytes = vec![0u8; topic_len];
    reader.read_exact(&mut topic_bytes)?;
    let topic = String::from_utf8(topic_bytes).map_err(|e| UhcError::Codec(e.to_string()))?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let payload_len = u32::from_be_bytes(len_bytes);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(UhcError::Codec(format!("payload length {payload_len} exceeds frame limit")));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;
    Ok((topic, payload))
}

/// Convenience wrapper: reads one frame and decodes its payload as `T`,
/// discarding the topic tag (used by listeners that only ever expect one
/// message type on their socket).
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, UhcError> {
    let (_, payload) = read_frame(reader)?;
    Ok(serde_json::from_slice(&payload)?)
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, UhcError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_topic_and_payload() {
        let msg = Sample { a: 7, b: "hi".into() };
        let mut buf = Vec::new();
        write_frame(&mut buf, "CSS", &msg).unwrap();

        let mut cursor = Cursor::new(buf);
        let (topic, payload) = read_frame(&mut cursor).unwrap();
        assert_eq!(topic, "CSS");
        let decoded: Sample = decode_payload(&payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_oversized_topic() {
        let msg = Sample { a: 1, b: "x".into() };
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, "THIS_TOPIC_TAG_IS_WAY_TOO_LONG", &msg).unwrap_err();
        assert!(matches!(err, UhcError::Codec(_)));
    }
}
