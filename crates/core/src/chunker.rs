//! Speech Chunker
//!
//! Turns the token deltas of one completion stream into segments that the
//! voice platform can start speaking before the full reply exists. A segment
//! is released as soon as a sentence ends or the buffered text grows past a
//! configured length, and the remainder is released when the stream ends.
//!
//! One `SpeechChunker` serves exactly one turn.

/// Characters that end a sentence for the purpose of flushing.
const SENTENCE_TERMINALS: [char; 3] = ['.', '!', '?'];

/// Tunables for the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Flush the buffer once it holds at least this many characters.
    pub max_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { max_chars: 50 }
    }
}

/// A speakable text segment produced by the chunker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechChunk {
    pub text: String,
    /// Set on the last chunk of the turn only.
    pub complete: bool,
}

impl SpeechChunk {
    fn partial(text: String) -> Self {
        Self {
            text,
            complete: false,
        }
    }

    fn terminal(text: String) -> Self {
        Self {
            text,
            complete: true,
        }
    }
}

/// Accumulates deltas and decides when to flush them as chunks.
#[derive(Debug)]
pub struct SpeechChunker {
    config: ChunkerConfig,
    buffer: String,
    /// A sentence that has been flushed but not yet handed out. It is released
    /// as soon as another delta arrives, or becomes the terminal chunk when the
    /// stream ends right after it.
    held_sentence: Option<String>,
}

impl SpeechChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config: ChunkerConfig {
                max_chars: config.max_chars.max(1),
            },
            buffer: String::new(),
            held_sentence: None,
        }
    }

    /// Appends one delta and returns the chunks it made ready, in order.
    ///
    /// Every returned chunk is non-terminal; the terminal chunk only comes
    /// out of [`SpeechChunker::finish`].
    pub fn push(&mut self, delta: &str) -> Vec<SpeechChunk> {
        if delta.is_empty() {
            return Vec::new();
        }

        let mut ready = Vec::new();
        if let Some(sentence) = self.held_sentence.take() {
            ready.push(SpeechChunk::partial(sentence));
        }

        self.buffer.push_str(delta);

        if let Some(split_at) = last_terminal_end(delta) {
            // Byte offset of the cut inside the buffer: everything before this
            // delta plus the delta prefix up to the terminal character.
            let cut = self.buffer.len() - delta.len() + split_at;
            let rest = self.buffer.split_off(cut);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            self.held_sentence = Some(sentence);
        }

        if self.buffer.chars().count() >= self.config.max_chars {
            if let Some(sentence) = self.held_sentence.take() {
                ready.push(SpeechChunk::partial(sentence));
            }
            ready.push(SpeechChunk::partial(std::mem::take(&mut self.buffer)));
        }

        ready
    }

    /// Ends the turn, returning the remaining chunks. The last one is always
    /// the terminal chunk, and there is always exactly one terminal chunk.
    pub fn finish(mut self) -> Vec<SpeechChunk> {
        let remainder = std::mem::take(&mut self.buffer);
        match self.held_sentence.take() {
            Some(sentence) if remainder.is_empty() => vec![SpeechChunk::terminal(sentence)],
            Some(sentence) => vec![
                SpeechChunk::partial(sentence),
                SpeechChunk::terminal(remainder),
            ],
            None => vec![SpeechChunk::terminal(remainder)],
        }
    }

    /// Ends the turn early. A sentence already flushed on punctuation comes
    /// back as a non-terminal chunk; text still in the buffer is dropped.
    pub fn abort(self) -> Option<SpeechChunk> {
        self.held_sentence.map(SpeechChunk::partial)
    }
}

/// Byte offset just past the last sentence-terminal character in `delta`.
fn last_terminal_end(delta: &str) -> Option<usize> {
    delta
        .char_indices()
        .filter(|(_, c)| SENTENCE_TERMINALS.contains(c))
        .last()
        .map(|(idx, c)| idx + c.len_utf8())
}
