use std::fmt;

use super::content::ContentChunk;

/// The unit carried over the content channel.
///
/// Only the first two `|` separators are significant: `data` is an encoded
/// [`ContentChunk`] and carries its own separator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentPacket {
    pub packet_id: String,
    pub client_id: String,
    pub data: String,
}

impl ContentPacket {
    pub fn new(
        packet_id: impl Into<String>,
        client_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            packet_id: packet_id.into(),
            client_id: client_id.into(),
            data: data.into(),
        }
    }

    /// Wrap a chunk in a packet with a fresh id
    pub fn from_chunk(client_id: impl Into<String>, chunk: &ContentChunk) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), client_id, chunk.encode())
    }

    /// Decode `packetId|clientId|data`; missing fields come back empty
    pub fn parse(s: &str) -> Self {
        let Some((packet_id, rest)) = s.split_once('|') else {
            return Self::new(s, "", "");
        };
        match rest.split_once('|') {
            Some((client_id, data)) => Self::new(packet_id, client_id, data),
            None => Self::new(packet_id, rest, ""),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// The content chunk this packet carries
    pub fn chunk(&self) -> ContentChunk {
        ContentChunk::parse(&self.data)
    }
}

impl fmt::Display for ContentPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.packet_id, self.client_id, self.data)
    }
}
