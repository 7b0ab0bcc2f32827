//! Wire protocol for whisper conversations
//!
//! Three pipe-delimited text formats travel between participants:
//! - content chunks (`offset|text`), the edits a Whisperer makes to the live line
//! - control chunks (`action|arg1|arg2|...`), out-of-band session signals
//! - content packets (`packetId|clientId|data`), the envelope for content chunks
//!
//! All parsing is total: malformed input degrades to an ignorable value instead
//! of an error, so a corrupt packet can never stall a session.

mod content;
mod control;
mod packet;

pub use content::{
    diff_lines, process_live_chunk, ContentChunk, CO_IGNORE, CO_NEWLINE, CO_PLAY_SOUND,
    LIVE_TEXT_FILLER, MAX_PADDED_OFFSET,
};
pub use control::{ControlChunk, ControlSignal};
pub use packet::ContentPacket;
