//! Recursive-boundary text chunker. Spec.md §4.2.
//!
//! Splits on paragraph, then sentence, then word, then character boundaries
//! to produce windows close to `target_size` with `target_overlap` between
//! consecutive windows. Windows shorter than `min_len` are dropped and
//! survivors are re-numbered contiguously from zero.

/// One chunk of the source text paired with its final, contiguous index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

pub struct Chunker {
    target_size: usize,
    target_overlap: usize,
    min_len: usize,
}

impl Chunker {
    pub fn new(target_size: usize, target_overlap: usize, min_len: usize) -> Self {
        Self {
            target_size: target_size.max(1),
            target_overlap: target_overlap.min(target_size.saturating_sub(1)),
            min_len,
        }
    }

    /// Split `text` into overlapping windows. Empty input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let windows = self.split_recursive(text);
        windows
            .into_iter()
            .filter(|w| w.chars().count() >= self.min_len)
            .enumerate()
            .map(|(index, text)| Chunk { index, text })
            .collect()
    }

    /// Recursively split on the largest boundary kind that actually reduces
    /// a piece below `target_size + target_overlap`, finally falling back to
    /// raw character slicing so the recursion always terminates.
    fn split_recursive(&self, text: &str) -> Vec<String> {
        let char_count = text.chars().count();
        if char_count <= self.target_size {
            return vec![text.to_string()];
        }

        for boundary in [Boundary::Paragraph, Boundary::Sentence, Boundary::Word] {
            if let Some(windows) = self.window_on_boundary(text, boundary) {
                return windows;
            }
        }

        self.window_on_chars(text)
    }

    /// Build overlapping windows by greedily packing boundary-separated
    /// pieces until the target size is reached, then starting the next
    /// window `target_overlap` chars back. Returns `None` when the text has
    /// no occurrences of this boundary kind (caller falls back further).
    fn window_on_boundary(&self, text: &str, boundary: Boundary) -> Option<Vec<String>> {
        let pieces: Vec<&str> = match boundary {
            Boundary::Paragraph => text.split("\n\n").collect(),
            Boundary::Sentence => split_sentences(text),
            Boundary::Word => text.split_whitespace().collect(),
        };
        if pieces.len() <= 1 {
            return None;
        }

        let sep = match boundary {
            Boundary::Paragraph => "\n\n",
            Boundary::Sentence => " ",
            Boundary::Word => " ",
        };

        let mut windows = Vec::new();
        let mut start = 0usize;
        while start < pieces.len() {
            let mut end = start;
            let mut len = 0usize;
            while end < pieces.len() {
                let piece_len = pieces[end].chars().count() + sep.len();
                if len > 0 && len + piece_len > self.target_size {
                    break;
                }
                len += piece_len;
                end += 1;
            }
            if end == start {
                end = start + 1;
            }
            windows.push(pieces[start..end].join(sep));

            if end >= pieces.len() {
                break;
            }

            // Step back by roughly `target_overlap` chars worth of pieces.
            let mut back = end;
            let mut overlap_len = 0usize;
            while back > start && overlap_len < self.target_overlap {
                back -= 1;
                overlap_len += pieces[back].chars().count() + sep.len();
            }
            start = if back > start { back } else { end };
        }
        Some(windows)
    }

    /// Last-resort fallback: fixed-width character windows with overlap.
    /// Always makes progress, guaranteeing the recursion terminates.
    fn window_on_chars(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut windows = Vec::new();
        let step = (self.target_size - self.target_overlap).max(1);
        let mut start = 0usize;
        while start < chars.len() {
            let end = (start + self.target_size).min(chars.len());
            windows.push(chars[start..end].iter().collect());
            if end >= chars.len() {
                break;
            }
            start += step;
        }
        windows
    }
}

#[derive(Clone, Copy)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

/// Naive sentence splitter: break after `.`, `!`, or `?` followed by
/// whitespace. Good enough for chunk boundary purposes; not a full NLP
/// sentence tokenizer.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if (c == b'.' || c == b'!' || c == b'?')
            && bytes.get(i + 1).map(|b| b.is_ascii_whitespace()).unwrap_or(true)
        {
            out.push(text[start..=i].trim());
            start = i + 1;
        }
        i += 1;
    }
    if start < text.len() {
        let rest = text[start..].trim();
        if !rest.is_empty() {
            out.push(rest);
        }
    }
    out.into_iter().filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        let c = Chunker::new(100, 20, 10);
        assert!(c.chunk("").is_empty());
        assert!(c.chunk("   \n\t").is_empty());
    }

    #[test]
    fn short_text_below_minimum_is_dropped() {
        let c = Chunker::new(100, 20, 50);
        assert!(c.chunk("too short").is_empty());
    }

    #[test]
    fn text_within_target_becomes_one_chunk() {
        let c = Chunker::new(1000, 200, 10);
        let text = "a short paragraph that fits in one chunk.";
        let chunks = c.chunk(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn indices_are_contiguous_from_zero() {
        let c = Chunker::new(40, 10, 5);
        let text = "one two three four five six seven eight nine ten eleven twelve thirteen fourteen fifteen sixteen";
        let chunks = c.chunk(text);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn degenerate_trailing_chunk_is_dropped() {
        let c = Chunker::new(20, 0, 15);
        // Construct text whose char-window fallback leaves a tiny tail.
        let text = "x".repeat(35);
        let chunks = c.chunk(&text);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() >= 15);
        }
    }

    #[test]
    fn overlap_shares_boundary_text_between_windows() {
        let c = Chunker::new(30, 10, 1);
        let text = "word ".repeat(40);
        let chunks = c.chunk(text.trim());
        assert!(chunks.len() > 1);
    }
}
