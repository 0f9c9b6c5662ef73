//! Streaming removal of `<think>…</think>` reasoning blocks.
//!
//! Tags may be split across network chunks (`"…<thi"` then `"nk>…"`), so the
//! filter keeps a small per-session buffer instead of looking at chunks in
//! isolation. Outside a block it only holds back characters that could still
//! become the opening tag; inside a block it keeps a rolling window the size
//! of the closing tag and emits nothing.

/// Opening delimiter of a reasoning block.
pub const OPEN_TAG: &str = "<think>";

/// Closing delimiter of a reasoning block.
pub const CLOSE_TAG: &str = "</think>";

/// Per-stream filter state.
#[derive(Debug, Default, Clone)]
pub struct ThinkTagFilter {
    in_think_block: bool,
    buffer: String,
}

impl ThinkTagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the stream is currently inside a reasoning block.
    pub fn in_think_block(&self) -> bool {
        self.in_think_block
    }

    /// Characters held back, waiting for more input.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Feed a chunk and return the text that is safe to show.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        for ch in chunk.chars() {
            if self.in_think_block {
                self.push_inside(ch);
            } else {
                self.push_outside(ch, &mut out);
            }
        }
        out
    }

    /// End of stream: release what can no longer become a tag.
    ///
    /// A partial opening tag at the very end is ordinary text. An unclosed
    /// reasoning block is dropped.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        if self.in_think_block {
            self.in_think_block = false;
            String::new()
        } else {
            rest
        }
    }

    fn push_outside(&mut self, ch: char, out: &mut String) {
        self.buffer.push(ch);
        if self.buffer == OPEN_TAG {
            self.buffer.clear();
            self.in_think_block = true;
            return;
        }
        // Release from the front until the rest could still start a tag.
        while !self.buffer.is_empty() && !OPEN_TAG.starts_with(self.buffer.as_str()) {
            let first = self.buffer.remove(0);
            out.push(first);
        }
    }

    fn push_inside(&mut self, ch: char) {
        self.buffer.push(ch);
        if self.buffer.ends_with(CLOSE_TAG) {
            self.buffer.clear();
            self.in_think_block = false;
            return;
        }
        while self.buffer.chars().count() > CLOSE_TAG.len() {
            self.buffer.remove(0);
        }
    }
}

/// Remove every reasoning block from a complete response.
pub fn strip_think_blocks(text: &str) -> String {
    let mut filter = ThinkTagFilter::new();
    let mut out = filter.push(text);
    out.push_str(&filter.finish());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> Vec<String> {
        let mut filter = ThinkTagFilter::new();
        let mut emitted: Vec<String> = chunks.iter().map(|c| filter.push(c)).collect();
        emitted.push(filter.finish());
        emitted
    }

    #[test]
    fn test_split_opening_tag() {
        let emitted = run(&["Hello <thi", "nk>secret</think> world"]);
        assert_eq!(emitted, vec!["Hello ", " world", ""]);
    }

    #[test]
    fn test_every_split_point_gives_same_output() {
        let input = "Hello <think>secret</think> world";
        for split in 0..=input.len() {
            let (a, b) = input.split_at(split);
            let joined: String = run(&[a, b]).concat();
            assert_eq!(joined, "Hello  world", "split at {}", split);
            assert!(!joined.contains("secret"));
        }
    }

    #[test]
    fn test_clean_input_passes_through() {
        let input = "a < b, x<y, <thin ice>, 3 <= 4 and unicode é漢字 <";
        for split in 0..input.chars().count() {
            let idx = input.char_indices().nth(split).map(|(i, _)| i).unwrap_or(input.len());
            let (a, b) = input.split_at(idx);
            assert_eq!(run(&[a, b]).concat(), input);
        }
    }

    #[test]
    fn test_char_by_char_stream() {
        let input = "<think>plan</think>Answer: 42";
        let mut filter = ThinkTagFilter::new();
        let mut out = String::new();
        for ch in input.chars() {
            out.push_str(&filter.push(&ch.to_string()));
        }
        out.push_str(&filter.finish());
        assert_eq!(out, "Answer: 42");
    }

    #[test]
    fn test_buffer_stays_bounded() {
        let mut filter = ThinkTagFilter::new();
        for ch in "text <thin".chars() {
            filter.push(&ch.to_string());
            assert!(filter.buffered().chars().count() < OPEN_TAG.len());
        }
        filter.push("k>");
        assert!(filter.in_think_block());
        for ch in "a very long reasoning trace without end".chars() {
            filter.push(&ch.to_string());
            assert!(filter.buffered().chars().count() <= CLOSE_TAG.len());
        }
    }

    #[test]
    fn test_unclosed_block_is_dropped() {
        assert_eq!(run(&["visible<think>never closed"]).concat(), "visible");
    }

    #[test]
    fn test_multiple_blocks() {
        assert_eq!(
            strip_think_blocks("<think>a</think>one <think>b</think>two"),
            "one two"
        );
    }

    #[test]
    fn test_split_closing_tag() {
        let emitted = run(&["<think>x</th", "ink>", "done"]);
        assert_eq!(emitted.concat(), "done");
    }
}
