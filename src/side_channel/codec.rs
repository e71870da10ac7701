//! Datagram format of the timestamp side-channel.
//!
//! ```text
//! 0      4   5                 21          29          37
//! +------+---+-----------------+-----------+-----------+
//! | AVTS | v | session uuid    | seq (u64) | send_time |
//! +------+---+-----------------+-----------+-----------+
//! ```
//!
//! Big endian; `send_time` is the IEEE-754 bit pattern of the f64 seconds.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::latency::TimestampRecord;

pub const MAGIC: &[u8; 4] = b"AVTS";
pub const VERSION: u8 = 1;
pub const DATAGRAM_LEN: usize = 4 + 1 + 16 + 8 + 8;

/// One received datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datagram {
    Record(TimestampRecord),
    /// Wrong magic, unknown version or wrong length
    Malformed { len: usize },
}

/// Encodes records into datagrams and decodes datagrams back.
///
/// Decoding always consumes the whole buffer: a datagram is either one record
/// or garbage, never a prefix of something longer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampCodec;

impl TimestampCodec {
    pub fn parse(datagram: &[u8]) -> Datagram {
        if datagram.len() != DATAGRAM_LEN
            || &datagram[..4] != MAGIC
            || datagram[4] != VERSION
        {
            return Datagram::Malformed { len: datagram.len() };
        }
        let mut buf = &datagram[5..];
        let mut session = [0u8; 16];
        buf.copy_to_slice(&mut session);
        let sequence_id = buf.get_u64();
        let send_time = buf.get_f64();
        if !send_time.is_finite() {
            return Datagram::Malformed { len: datagram.len() };
        }
        Datagram::Record(TimestampRecord {
            session: Uuid::from_bytes(session),
            sequence_id,
            send_time,
        })
    }
}

impl Encoder<TimestampRecord> for TimestampCodec {
    type Error = std::io::Error;

    fn encode(&mut self, record: TimestampRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(DATAGRAM_LEN);
        dst.put_slice(MAGIC);
        dst.put_u8(VERSION);
        dst.put_slice(record.session.as_bytes());
        dst.put_u64(record.sequence_id);
        dst.put_f64(record.send_time);
        Ok(())
    }
}

impl Decoder for TimestampCodec {
    type Item = Datagram;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split_to(src.len());
        Ok(Some(Self::parse(&datagram)))
    }
}
