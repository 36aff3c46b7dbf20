//! Segments a streamed LLM token sequence into TTS-sized utterances.
//!
//! Mirrors the original plugin's `TextChunker`: a rolling buffer flushed on
//! strong sentence-ending punctuation, forced length limits, or weak
//! (comma-class) punctuation once a minimum buffer length is reached.

/// One flushed chunk: `(seq, text, is_final)`. `is_final` marks a flush
/// triggered by a strong delimiter (a complete sentence) rather than a
/// length- or weak-delimiter-driven split.
pub type Chunk = (u64, String, bool);

fn is_strong_delimiter(c: char) -> bool {
    matches!(
        c,
        '。' | '!' | '\u{ff01}' | '?' | '\u{ff1f}' | '\n' | '~' | '～' | '…' | '—'
    )
}

fn is_weak_delimiter(c: char) -> bool {
    matches!(c, ',' | '\u{ff0c}' | ';' | '\u{ff1b}' | ':' | '\u{ff1a}')
}

#[derive(Debug, Clone)]
pub struct TextChunker {
    min_chunk_size: usize,
    max_chunk_size: usize,
    buffer: String,
    seq: u64,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(10, 50)
    }
}

impl TextChunker {
    pub fn new(min_chunk_size: usize, max_chunk_size: usize) -> Self {
        Self {
            min_chunk_size,
            max_chunk_size,
            buffer: String::new(),
            seq: 0,
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.seq = 0;
    }

    fn take_chunk(&mut self, is_final: bool) -> Option<Chunk> {
        let text = self.buffer.trim().to_string();
        self.buffer.clear();
        if text.is_empty() {
            return None;
        }
        let seq = self.seq;
        self.seq += 1;
        Some((seq, text, is_final))
    }

    /// Feed one inbound text fragment (may be multiple characters, as LLM
    /// providers that don't truly stream token-by-token hand back whole
    /// sentences in one chunk), emitting every chunk the fragment completes.
    pub fn process(&mut self, text_stream: &str) -> Vec<Chunk> {
        let mut out = Vec::new();
        for c in text_stream.chars() {
            self.buffer.push(c);

            if is_strong_delimiter(c) {
                if let Some(chunk) = self.take_chunk(true) {
                    out.push(chunk);
                }
                continue;
            }

            if self.buffer.chars().count() >= self.max_chunk_size {
                if let Some(chunk) = self.take_chunk(false) {
                    out.push(chunk);
                }
                continue;
            }

            if is_weak_delimiter(c) && self.buffer.chars().count() > self.min_chunk_size {
                if let Some(chunk) = self.take_chunk(false) {
                    out.push(chunk);
                }
            }
        }
        out
    }

    /// Flush any residual buffer at stream end, always marked final.
    pub fn flush(&mut self) -> Option<Chunk> {
        self.take_chunk(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_delimiter_flushes_immediately() {
        let mut c = TextChunker::default();
        let chunks = c.process("你好。");
        assert_eq!(chunks, vec![(0, "你好。".to_string(), true)]);
    }

    #[test]
    fn weak_delimiter_requires_min_length() {
        let mut c = TextChunker::new(10, 50);
        assert!(c.process("短,").is_empty());
        let long_enough = "a".repeat(11);
        let chunks = c.process(&format!("{},", long_enough));
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].2);
    }

    #[test]
    fn max_size_forces_split_without_delimiter() {
        let mut c = TextChunker::new(10, 50);
        let input = "a".repeat(2 * 50 + 1);
        let mut chunks = c.process(&input);
        assert_eq!(chunks.len(), 2);
        if let Some(last) = c.flush() {
            chunks.push(last);
        }
        assert_eq!(chunks.len(), 3);
        let rebuilt: String = chunks.iter().map(|(_, t, _)| t.as_str()).collect();
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn flush_emits_residual_as_final() {
        let mut c = TextChunker::default();
        c.process("剩余文本");
        let flushed = c.flush().unwrap();
        assert_eq!(flushed, (0, "剩余文本".to_string(), true));
        assert!(c.flush().is_none());
    }

    #[test]
    fn round_trip_preserves_text_ignoring_whitespace_trims() {
        let mut c = TextChunker::default();
        let input = "第一句。第二句！第三句没有标点";
        let mut chunks = c.process(input);
        if let Some(last) = c.flush() {
            chunks.push(last);
        }
        let rebuilt: String = chunks.iter().map(|(_, t, _)| t.as_str()).collect();
        assert_eq!(rebuilt, input);
        let seqs: Vec<u64> = chunks.iter().map(|(s, _, _)| *s).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }
}
