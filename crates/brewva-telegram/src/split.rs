//! Fence-aware text chunking.
//!
//! Outbound text is split into provider-sized chunks. Splits prefer a line
//! break once a chunk is at least 40% full, and triple-backtick fences never
//! break across chunks: a split inside an open fence closes it on the
//! emitted chunk and reopens it (with the original language tag) on the
//! next.

const FENCE: &str = "```";
const FENCE_CLOSE: &str = "\n```";

/// Split `text` into chunks of at most `max_len` bytes.
#[must_use]
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.len() <= max_len {
        return vec![text.to_string()];
    }
    let min_break = max_len * 2 / 5;

    let mut chunks = Vec::new();
    let mut remaining = text.to_string();
    // Language of the fence open at the start of `remaining`, in the
    // original document's terms.
    let mut fence: Option<String> = None;

    loop {
        if remaining.len() <= max_len {
            chunks.push(remaining);
            break;
        }

        // Reserve room for a fence close we might have to append.
        let budget = max_len.saturating_sub(FENCE_CLOSE.len()).max(1);
        let hard = remaining.floor_char_boundary(budget);
        let mut split_at = find_line_break(&remaining, hard, min_break).unwrap_or(hard);
        if split_at == 0 {
            // A multi-byte char wider than the budget; take exactly one char.
            split_at = remaining
                .char_indices()
                .nth(1)
                .map_or(remaining.len(), |(i, _)| i);
        }

        let (head, tail) = remaining.split_at(split_at);
        let trimmed = head.trim_end_matches('\n');
        let mut chunk = if trimmed.is_empty() {
            head.to_string()
        } else {
            trimmed.to_string()
        };
        let mut rest = tail.trim_start_matches('\n').to_string();

        fence = scan_fences(&chunk, fence);
        if let Some(lang) = fence.take() {
            // Close on this chunk, reopen on the next. The reopened marker
            // toggles the (now reset) state back open when the next chunk is
            // scanned.
            chunk.push_str(FENCE_CLOSE);
            rest = format!("{FENCE}{lang}\n{rest}");
        }

        chunks.push(chunk);
        remaining = rest;
    }
    chunks
}

/// Last line break within `boundary` whose split point is at least
/// `min_break` bytes in.
fn find_line_break(text: &str, boundary: usize, min_break: usize) -> Option<usize> {
    let split = text[..boundary].rfind('\n').map(|pos| pos + 1)?;
    (split >= min_break).then_some(split)
}

/// Fold fence toggles in `chunk` onto `state`.
fn scan_fences(chunk: &str, mut state: Option<String>) -> Option<String> {
    for line in chunk.lines() {
        if let Some(tag) = line.trim_start().strip_prefix(FENCE) {
            state = match state {
                None => Some(tag.trim().to_string()),
                Some(_) => None,
            };
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_all_within(chunks: &[String], max_len: usize) {
        for chunk in chunks {
            assert!(chunk.len() <= max_len, "chunk of {} > {max_len}", chunk.len());
        }
    }

    fn fence_markers(chunk: &str) -> usize {
        chunk
            .lines()
            .filter(|l| l.trim_start().starts_with(FENCE))
            .count()
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_text("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn plain_text_splits_within_limit() {
        let text = "word ".repeat(200);
        let chunks = split_text(&text, 100);
        assert!(chunks.len() > 1);
        assert_all_within(&chunks, 100);
    }

    #[test]
    fn prefers_line_breaks_past_forty_percent() {
        let text = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = split_text(&text, 100);
        assert_eq!(chunks.len(), 2);
        // The break after byte 60 is past 40% of 100, so it is taken.
        assert_eq!(chunks[0], "a".repeat(60));
        assert_eq!(chunks[1], "b".repeat(60));
        assert_all_within(&chunks, 100);
    }

    #[test]
    fn early_line_break_is_ignored() {
        // Break at byte 11 is below 40% of 100; prefer a fuller hard cut.
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(200));
        let chunks = split_text(&text, 100);
        assert!(chunks[0].len() > 40, "chunk was only {}", chunks[0].len());
        assert_all_within(&chunks, 100);
    }

    #[test]
    fn open_fence_is_closed_and_reopened() {
        let code = "x();\n".repeat(40); // 200 bytes of code
        let text = format!("```rust\n{code}```");
        let chunks = split_text(&text, 100);
        assert!(chunks.len() > 1);
        assert_all_within(&chunks, 100);

        // Every chunk is fence-balanced on its own.
        for chunk in &chunks {
            assert_eq!(fence_markers(chunk) % 2, 0, "unbalanced chunk: {chunk:?}");
        }
        // Continuation chunks reopen with the language tag.
        for chunk in &chunks[1..] {
            assert!(chunk.starts_with("```rust\n"), "missing reopen: {chunk:?}");
        }
        // Emitted chunks close the fence.
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.ends_with("```"), "missing close: {chunk:?}");
        }
    }

    #[test]
    fn text_outside_fences_is_not_wrapped() {
        let text = "plain ".repeat(50);
        let chunks = split_text(&text, 100);
        for chunk in &chunks {
            assert_eq!(fence_markers(chunk), 0);
        }
    }

    #[test]
    fn closed_fence_before_split_stays_closed() {
        let text = format!("```\ncode\n```\n{}", "after ".repeat(40));
        let chunks = split_text(&text, 100);
        assert_all_within(&chunks, 100);
        for chunk in &chunks {
            assert_eq!(fence_markers(chunk) % 2, 0);
        }
        // Nothing after the closed fence should be re-wrapped in a fence.
        assert!(!chunks.last().unwrap().starts_with(FENCE));
    }

    #[test]
    fn content_is_preserved_outside_added_markers() {
        let code = "line();\n".repeat(30);
        let text = format!("intro\n```py\n{code}```\noutro");
        let chunks = split_text(&text, 80);
        let rejoined = chunks.join("\n");
        // Every original code line survives somewhere.
        assert!(rejoined.contains("intro"));
        assert!(rejoined.contains("outro"));
        assert_eq!(rejoined.matches("line();").count(), 30);
    }

    #[test]
    fn multibyte_text_never_panics() {
        let text = "あいうえお".repeat(100); // 1500 bytes
        let chunks = split_text(&text, 64);
        assert_all_within(&chunks, 64);
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn tiny_limit_still_makes_progress() {
        let chunks = split_text("あああ", 2);
        assert_eq!(chunks.join(""), "あああ");
    }

    #[test]
    fn default_limit_matches_provider() {
        let text = "x".repeat(5000);
        let chunks = split_text(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert_all_within(&chunks, 4096);
    }
}
