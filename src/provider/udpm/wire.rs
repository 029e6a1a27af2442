//! Multicast datagram format.
//!
//! All integers are big-endian.
//!
//! Short datagram, used when the whole message fits in one datagram:
//!
//! ```text
//! [magic "LC02":4][msg_seq:4][channel][0x00][payload]
//! ```
//!
//! Fragment datagram:
//!
//! ```text
//! [magic "LC03":4][msg_seq:4][msg_size:4][fragment_offset:4]
//! [fragment_no:2][fragment_count:2][data]
//! ```
//!
//! Fragment 0 carries `channel 0x00` ahead of its data. `msg_size` is the
//! payload length and `fragment_offset` the position of `data` within the
//! payload, so fragments can be placed in any arrival order.

use thiserror::Error;

pub const MAGIC_SHORT: u32 = 0x4C43_3032;
pub const MAGIC_FRAGMENT: u32 = 0x4C43_3033;
pub const SHORT_HEADER_SIZE: usize = 8;
pub const FRAGMENT_HEADER_SIZE: usize = 20;
/// Longest channel name carried over the network.
pub const MAX_CHANNEL_LEN: usize = 63;
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram too short: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("unknown magic {0:#010x}")]
    BadMagic(u32),
    #[error("channel name is not terminated")]
    UnterminatedChannel,
    #[error("channel name is not valid utf-8")]
    InvalidChannel,
    #[error("fragment {index} of {count} is out of range")]
    FragmentIndex { index: u16, count: u16 },
    #[error("fragment data [{offset}, +{len}) exceeds message size {size}")]
    FragmentBounds { offset: u32, len: usize, size: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram<'a> {
    Short {
        seq: u32,
        channel: &'a str,
        payload: &'a [u8],
    },
    Fragment(Fragment<'a>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub seq: u32,
    pub msg_size: u32,
    pub offset: u32,
    pub index: u16,
    pub count: u16,
    /// Present on fragment 0 only.
    pub channel: Option<&'a str>,
    pub data: &'a [u8],
}

/// Splits one message into the datagrams that carry it, none longer than
/// `mtu` bytes. Returns `None` if it would need more than `MAX_FRAGMENTS`.
pub fn encode_message(seq: u32, channel: &str, payload: &[u8], mtu: usize) -> Option<Vec<Vec<u8>>> {
    let channel_field = channel.len() + 1;
    if SHORT_HEADER_SIZE + channel_field + payload.len() <= mtu {
        let mut buf = Vec::with_capacity(SHORT_HEADER_SIZE + channel_field + payload.len());
        buf.extend_from_slice(&MAGIC_SHORT.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(channel.as_bytes());
        buf.push(0);
        buf.extend_from_slice(payload);
        return Some(vec![buf]);
    }

    let per_fragment = mtu.checked_sub(FRAGMENT_HEADER_SIZE)?;
    let first_data = per_fragment.checked_sub(channel_field).filter(|n| *n > 0)?;
    let rest = payload.len().saturating_sub(first_data);
    let count = 1 + (rest + per_fragment - 1) / per_fragment;
    if count > MAX_FRAGMENTS {
        return None;
    }
    let msg_size = u32::try_from(payload.len()).ok()?;

    let mut datagrams = Vec::with_capacity(count);
    let mut offset = 0usize;
    for index in 0..count {
        let take = if index == 0 { first_data } else { per_fragment };
        let end = (offset + take).min(payload.len());
        let mut buf = Vec::with_capacity(mtu);
        buf.extend_from_slice(&MAGIC_FRAGMENT.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&msg_size.to_be_bytes());
        buf.extend_from_slice(&(offset as u32).to_be_bytes());
        buf.extend_from_slice(&(index as u16).to_be_bytes());
        buf.extend_from_slice(&(count as u16).to_be_bytes());
        if index == 0 {
            buf.extend_from_slice(channel.as_bytes());
            buf.push(0);
        }
        buf.extend_from_slice(&payload[offset..end]);
        datagrams.push(buf);
        offset = end;
    }
    Some(datagrams)
}

pub fn decode(buf: &[u8]) -> Result<Datagram<'_>, WireError> {
    if buf.len() < SHORT_HEADER_SIZE {
        return Err(WireError::Truncated {
            needed: SHORT_HEADER_SIZE,
            have: buf.len(),
        });
    }
    let magic = read_u32(buf, 0);
    let seq = read_u32(buf, 4);
    match magic {
        MAGIC_SHORT => {
            let (channel, payload) = split_channel(&buf[SHORT_HEADER_SIZE..])?;
            Ok(Datagram::Short {
                seq,
                channel,
                payload,
            })
        }
        MAGIC_FRAGMENT => {
            if buf.len() < FRAGMENT_HEADER_SIZE {
                return Err(WireError::Truncated {
                    needed: FRAGMENT_HEADER_SIZE,
                    have: buf.len(),
                });
            }
            let msg_size = read_u32(buf, 8);
            let offset = read_u32(buf, 12);
            let index = u16::from_be_bytes([buf[16], buf[17]]);
            let count = u16::from_be_bytes([buf[18], buf[19]]);
            if count == 0 || index >= count {
                return Err(WireError::FragmentIndex { index, count });
            }
            let body = &buf[FRAGMENT_HEADER_SIZE..];
            let (channel, data) = if index == 0 {
                let (channel, data) = split_channel(body)?;
                (Some(channel), data)
            } else {
                (None, body)
            };
            if offset as u64 + data.len() as u64 > msg_size as u64 {
                return Err(WireError::FragmentBounds {
                    offset,
                    len: data.len(),
                    size: msg_size,
                });
            }
            Ok(Datagram::Fragment(Fragment {
                seq,
                msg_size,
                offset,
                index,
                count,
                channel,
                data,
            }))
        }
        other => Err(WireError::BadMagic(other)),
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn split_channel(body: &[u8]) -> Result<(&str, &[u8]), WireError> {
    let nul = body
        .iter()
        .take(MAX_CHANNEL_LEN + 1)
        .position(|b| *b == 0)
        .ok_or(WireError::UnterminatedChannel)?;
    let channel = std::str::from_utf8(&body[..nul]).map_err(|_| WireError::InvalidChannel)?;
    Ok((channel, &body[nul + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_message_is_one_short_datagram() {
        let datagrams = encode_message(7, "POSE", b"xyz", 1500).unwrap();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(&datagrams[0][0..4], b"LC02");
        match decode(&datagrams[0]).unwrap() {
            Datagram::Short {
                seq,
                channel,
                payload,
            } => {
                assert_eq!(seq, 7);
                assert_eq!(channel, "POSE");
                assert_eq!(payload, b"xyz");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn large_message_fragments_within_mtu() {
        let payload: Vec<u8> = (0..1000u32).map(|n| n as u8).collect();
        let mtu = 128;
        let datagrams = encode_message(3, "MAP", &payload, mtu).unwrap();
        assert!(datagrams.len() > 1);
        assert!(datagrams.iter().all(|d| d.len() <= mtu));

        let mut rebuilt = vec![0u8; payload.len()];
        for (i, datagram) in datagrams.iter().enumerate() {
            let Datagram::Fragment(frag) = decode(datagram).unwrap() else {
                panic!("expected fragment");
            };
            assert_eq!(frag.index as usize, i);
            assert_eq!(frag.count as usize, datagrams.len());
            assert_eq!(frag.msg_size as usize, payload.len());
            assert_eq!(frag.channel.is_some(), i == 0);
            let start = frag.offset as usize;
            rebuilt[start..start + frag.data.len()].copy_from_slice(frag.data);
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn rejects_malformed_datagrams() {
        assert!(matches!(decode(b"LC0"), Err(WireError::Truncated { .. })));
        assert!(matches!(
            decode(b"XXXX\0\0\0\x01CH\0"),
            Err(WireError::BadMagic(_))
        ));
        assert!(matches!(
            decode(b"LC02\0\0\0\x01CHAN"),
            Err(WireError::UnterminatedChannel)
        ));

        let mut frag = encode_message(1, "C", &[0u8; 400], 128).unwrap().remove(1);
        // fragment_no := fragment_count
        let count = [frag[18], frag[19]];
        frag[16..18].copy_from_slice(&count);
        assert!(matches!(decode(&frag), Err(WireError::FragmentIndex { .. })));
    }

    #[test]
    fn too_many_fragments_is_refused() {
        let payload = vec![0u8; (MAX_FRAGMENTS + 1) * (128 - FRAGMENT_HEADER_SIZE)];
        assert!(encode_message(0, "BIG", &payload, 128).is_none());
    }
}
