use std::fmt;

/// Shift the current live text to past text (chunk text is ignored)
pub const CO_NEWLINE: i64 = -1;

/// Play the local sound resource named by the chunk text
pub const CO_PLAY_SOUND: i64 = -2;

/// Ignore this chunk (recovery from transmission errors)
pub const CO_IGNORE: i64 = -1000;

/// Character used to fill the gap when an offset lands past the end of the live text
pub const LIVE_TEXT_FILLER: char = '?';

/// Offsets further than this past the live text are treated as corrupt and ignored
pub const MAX_PADDED_OFFSET: usize = 64 * 1024;

/// An offset-addressed edit to the live line.
///
/// Offsets count Unicode scalar values, not bytes, so a chunk can never split a
/// character. For ASCII text the two are identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    pub offset: i64,
    pub text: String,
}

impl ContentChunk {
    pub fn new(offset: i64, text: impl Into<String>) -> Self {
        Self {
            offset,
            text: text.into(),
        }
    }

    /// A chunk that commits the live line to past text
    pub fn newline() -> Self {
        Self::new(CO_NEWLINE, "")
    }

    /// Decode `offset|text`.
    ///
    /// Input without a separator, or with a non-numeric offset, becomes an
    /// ignore chunk carrying the whole input as its text.
    pub fn parse(s: &str) -> Self {
        match s.split_once('|') {
            Some((left, right)) => match left.parse::<i64>() {
                Ok(offset) => Self::new(offset, right),
                Err(_) => Self::new(CO_IGNORE, s),
            },
            None => Self::new(CO_IGNORE, s),
        }
    }

    /// Encode as `offset|text`
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn is_newline(&self) -> bool {
        self.offset == CO_NEWLINE
    }

    /// Human-readable form for logs
    pub fn describe(&self) -> String {
        if self.offset >= 0 {
            return self.encode();
        }
        let name = match self.offset {
            CO_NEWLINE => "newline",
            CO_PLAY_SOUND => "play sound",
            CO_IGNORE => "ignore",
            other => return format!("unknown offset {}: {}", other, self.text),
        };
        if self.text.is_empty() {
            name.to_string()
        } else {
            format!("{}: {}", name, self.text)
        }
    }
}

impl fmt::Display for ContentChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.offset, self.text)
    }
}

/// Play a content chunk against the current live text.
///
/// Returns the new live text and any lines of past text the chunk created.
/// Chunks that don't edit text (sounds, ignored packets) leave the live text
/// untouched. An offset past the end of the live text is padded with
/// [`LIVE_TEXT_FILLER`] before the chunk text is appended.
pub fn process_live_chunk(old_live: &str, chunk: &ContentChunk) -> (String, Vec<String>) {
    if chunk.offset < CO_NEWLINE {
        return (old_live.to_string(), Vec::new());
    }
    if chunk.offset == CO_NEWLINE {
        return (String::new(), vec![old_live.to_string()]);
    }

    let offset = usize::try_from(chunk.offset).unwrap_or(usize::MAX);
    let len = old_live.chars().count();
    if offset > len && offset - len > MAX_PADDED_OFFSET {
        return (old_live.to_string(), Vec::new());
    }

    let mut live = if offset > len {
        let mut padded = String::with_capacity(old_live.len() + (offset - len) + chunk.text.len());
        padded.push_str(old_live);
        padded.extend(std::iter::repeat(LIVE_TEXT_FILLER).take(offset - len));
        padded
    } else {
        old_live[..byte_index(old_live, offset)].to_string()
    };
    live.push_str(&chunk.text);

    (live, Vec::new())
}

/// Compute the chunks a Whisperer sends when their live text changes from
/// `old_live` to `new_live` (by typing, or by pasting several lines at once).
///
/// Identical strings produce no chunks. A change without newlines produces one
/// chunk. Otherwise the chunks must be replayed in order to reach the same live
/// and past text.
pub fn diff_lines(old_live: &str, new_live: &str) -> Vec<ContentChunk> {
    let mut old_chars = old_live.chars();
    let mut shared = 0usize;

    for (pos, new_char) in new_live.char_indices() {
        match old_chars.next() {
            Some(old_char) if old_char == new_char => shared += 1,
            _ => return suffix_to_chunks(&new_live[pos..], shared),
        }
    }

    // new_live is exhausted: it equals old_live or is a strict prefix of it
    if old_chars.next().is_some() {
        vec![ContentChunk::new(shared as i64, "")]
    } else {
        Vec::new()
    }
}

fn suffix_to_chunks(suffix: &str, start: usize) -> Vec<ContentChunk> {
    let mut lines = suffix.split('\n');
    let mut chunks = Vec::new();

    if let Some(first) = lines.next() {
        chunks.push(ContentChunk::new(start as i64, first));
    }
    for line in lines {
        chunks.push(ContentChunk::newline());
        chunks.push(ContentChunk::new(0, line));
    }

    chunks
}

/// Byte index of the `chars`-th character, or the string length if shorter
fn byte_index(s: &str, chars: usize) -> usize {
    s.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}
