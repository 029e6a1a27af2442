use crate::{Error, Result};

/// Marker that starts every record; readers scan for it to find boundaries.
pub const SYNC_WORD: u32 = 0xEDA1_DA01;

/// Fixed header: sync word, eventnum, timestamp, channel length, payload length.
pub const HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 4;

/// Longest channel name a record may carry. Readers reject anything longer
/// as corrupt, so writers refuse to produce it.
pub const MAX_CHANNEL_LEN: usize = 999;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub eventnum: i64,
    pub timestamp_us: i64,
    pub channel_len: i32,
    pub payload_len: i32,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&SYNC_WORD.to_be_bytes());
        buf[4..12].copy_from_slice(&self.eventnum.to_be_bytes());
        buf[12..20].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf[20..24].copy_from_slice(&self.channel_len.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Parses a header, rejecting a wrong sync word or lengths no writer
    /// would have produced.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        let sync = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if sync != SYNC_WORD {
            return Err(Error::CorruptRecord("missing sync word"));
        }
        let mut word8 = [0u8; 8];
        word8.copy_from_slice(&bytes[4..12]);
        let eventnum = i64::from_be_bytes(word8);
        word8.copy_from_slice(&bytes[12..20]);
        let timestamp_us = i64::from_be_bytes(word8);
        let channel_len = i32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        let payload_len = i32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);

        if channel_len <= 0 || channel_len as usize > MAX_CHANNEL_LEN {
            return Err(Error::CorruptRecord("channel length out of range"));
        }
        if payload_len < 0 {
            return Err(Error::CorruptRecord("negative payload length"));
        }
        Ok(Self {
            eventnum,
            timestamp_us,
            channel_len,
            payload_len,
        })
    }

    /// Bytes following the fixed header.
    pub fn body_len(&self) -> u64 {
        self.channel_len as u64 + self.payload_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_big_endian_layout() {
        let header = RecordHeader {
            eventnum: 1,
            timestamp_us: 0x0102_0304_0506_0708,
            channel_len: 4,
            payload_len: 3,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &[0xED, 0xA1, 0xDA, 0x01]);
        assert_eq!(&bytes[4..12], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[12..20], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 4]);
        assert_eq!(&bytes[24..28], &[0, 0, 0, 3]);
        assert_eq!(RecordHeader::decode(&bytes).unwrap(), header);
        assert_eq!(header.body_len(), 7);
    }

    #[test]
    fn rejects_insane_lengths() {
        let mut header = RecordHeader {
            eventnum: 0,
            timestamp_us: 0,
            channel_len: -1,
            payload_len: 0,
        };
        assert!(matches!(
            RecordHeader::decode(&header.encode()),
            Err(Error::CorruptRecord(_))
        ));

        header.channel_len = 1000;
        assert!(RecordHeader::decode(&header.encode()).is_err());

        header.channel_len = 4;
        header.payload_len = -7;
        assert!(RecordHeader::decode(&header.encode()).is_err());
    }
}
