//! Text segmentation: arbitrary text → bounded, speech-safe chunks.
//!
//! Sentences end at `.`, `!` or `?` followed by whitespace. Sentences are
//! packed into chunks of at most `max_chars` characters; a single sentence
//! longer than the limit becomes its own chunk. Text with no sentence
//! boundary at all is sliced at exactly `max_chars` characters.
//!
//! Chunks partition the input exactly: concatenating them yields the
//! original text, whitespace included. Lengths and offsets are counted in
//! characters, not bytes.

/// An immutable slice of the session text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    text: String,
    start: usize,
    chars: usize,
}

impl Chunk {
    fn new(text: &str, start: usize) -> Self {
        Self {
            text: text.to_string(),
            start,
            chars: text.chars().count(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Character offset of this chunk in the source text.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    /// Character offset one past the end of this chunk.
    pub fn end(&self) -> usize {
        self.start + self.chars
    }

    /// Same chunk, shifted by `offset` characters.
    pub(crate) fn shifted(mut self, offset: usize) -> Self {
        self.start += offset;
        self
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// `max_chars` of zero is treated as one. Empty input yields no chunks.
pub fn segment(text: &str, max_chars: usize) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    if text.is_empty() {
        return Vec::new();
    }

    let sentences = split_sentences(text);
    if sentences.len() < 2 {
        return slice_fixed(text, max_chars);
    }

    let mut chunks = Vec::new();
    let mut buf_start = 0usize; // byte offset of buffer start
    let mut buf_end = 0usize; // byte offset of buffer end
    let mut buf_chars = 0usize;
    let mut char_offset = 0usize;

    for sentence in sentences {
        let sentence_chars = text[sentence.0..sentence.1].chars().count();
        if buf_chars > 0 && buf_chars + sentence_chars > max_chars {
            chunks.push(Chunk::new(&text[buf_start..buf_end], char_offset));
            char_offset += buf_chars;
            buf_start = buf_end;
            buf_chars = 0;
        }
        buf_end = sentence.1;
        buf_chars += sentence_chars;
    }

    if buf_chars > 0 {
        chunks.push(Chunk::new(&text[buf_start..buf_end], char_offset));
    }

    chunks
}

/// Byte ranges of sentences. Each range ends just after its terminal
/// punctuation; the following whitespace starts the next sentence.
fn split_sentences(text: &str) -> Vec<(usize, usize)> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    let end = i + c.len_utf8();
                    sentences.push((start, end));
                    start = end;
                }
            }
        }
    }

    if start < text.len() {
        sentences.push((start, text.len()));
    }

    sentences
}

/// Fixed-length slicing on character boundaries.
fn slice_fixed(text: &str, max_chars: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut start_byte = 0;
    let mut start_char = 0;
    let mut count = 0;

    for (i, _) in text.char_indices() {
        if count == max_chars {
            chunks.push(Chunk::new(&text[start_byte..i], start_char));
            start_byte = i;
            start_char += count;
            count = 0;
        }
        count += 1;
    }

    if count > 0 {
        chunks.push(Chunk::new(&text[start_byte..], start_char));
    }

    chunks
}
