/// A received message. The payload is opaque to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
    /// Microseconds since the UNIX epoch at which the provider received the
    /// message (for replayed logs, the recorded timestamp).
    pub recv_timestamp_us: i64,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>, recv_timestamp_us: i64) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            recv_timestamp_us,
        }
    }
}
