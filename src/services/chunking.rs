//! Text chunking strategies.
//!
//! All lengths are counted in `char`s, not bytes, so multi-byte text never
//! splits inside a code point. Chunk order always follows reading order.

use once_cell::sync::Lazy;
use regex::Regex;

/// Sentence boundary: sentence-ending punctuation (optionally followed by a
/// closing quote or bracket) followed by whitespace.
static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.!?…]["»)]?\s+"#).expect("valid sentence boundary regex"));

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…')
}

/// Split text into sentences. A trailing fragment without terminal
/// punctuation is kept as its own sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BOUNDARY.find_iter(text) {
        let sentence = text[start..m.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = m.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Front-loaded near-even split: distribute `count` items into `groups`
/// buckets whose sizes differ by at most one, earlier buckets taking the
/// remainder. The same rule is used for sentence balancing, chunk-group
/// merging and image-slice assignment.
pub fn partition_front_loaded(count: usize, groups: usize) -> Vec<usize> {
    let groups = groups.max(1);
    let base = count / groups;
    let remainder = count % groups;
    (0..groups)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Split `text` into up to `n` chunks balanced by sentence count.
///
/// When fewer sentences than `n` exist, falls back to proportional character
/// slicing (empty pieces dropped; a text with no usable slice comes back as
/// one piece).
pub fn chunk_balanced(text: &str, n: usize) -> Vec<String> {
    let n = n.max(1);
    let sentences = split_sentences(text);

    if sentences.len() < n {
        return slice_by_chars(text, n);
    }

    let sizes = partition_front_loaded(sentences.len(), n);
    let mut chunks = Vec::with_capacity(n);
    let mut cursor = 0;
    for size in sizes {
        let group = sentences[cursor..cursor + size].join(" ");
        chunks.push(group);
        cursor += size;
    }
    chunks
}

fn slice_by_chars(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let sizes = partition_front_loaded(chars.len(), n);
    let mut pieces = Vec::new();
    let mut cursor = 0;
    for size in sizes {
        let piece: String = chars[cursor..cursor + size].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        cursor += size;
    }
    if pieces.is_empty() {
        return vec![text.to_string()];
    }
    pieces
}

/// Greedily cut `text` into pieces of at most `limit` characters, preferring
/// to cut right after sentence-ending punctuation or a newline, then at the
/// nearest whitespace, and only mid-word as a last resort.
pub fn chunk_by_limit(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= limit {
            let piece: String = chars[start..].iter().collect();
            let piece = piece.trim().to_string();
            if !piece.is_empty() {
                pieces.push(piece);
            }
            break;
        }

        let window_end = start + limit;
        let mut cut = None;
        // Nearest sentence end or newline, searching backward from the limit.
        for i in (start..window_end).rev() {
            if is_sentence_end(chars[i]) || chars[i] == '\n' {
                cut = Some(i + 1);
                break;
            }
        }
        // Else nearest whitespace.
        if cut.is_none() {
            for i in (start..window_end).rev() {
                if chars[i].is_whitespace() {
                    cut = Some(i + 1);
                    break;
                }
            }
        }
        // Else cut mid-word. Each iteration must strictly shrink the rest.
        let cut = cut.unwrap_or(window_end).max(start + 1);

        let piece: String = chars[start..cut].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        start = cut;
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
    }

    pieces
}

/// Chunking for the quota-constrained speech backend, where minimizing
/// request count matters more than minimizing request size.
///
/// Consecutive sentences are grouped into roughly `target_n` buckets; a
/// bucket closes when its accumulated length would exceed `limit` or its
/// sentences-per-bucket quota is reached. A final bucket smaller than 20%
/// of `limit` is folded into its predecessor when that keeps the
/// predecessor within the limit.
pub fn chunk_for_quota_backend(text: &str, limit: usize, target_n: usize) -> Vec<String> {
    let limit = limit.max(1);
    let target_n = target_n.max(1);

    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let sentences = split_sentences(text);
    if sentences.len() < target_n {
        return chunk_by_limit(text, limit);
    }

    let per_bucket = sentences.len().div_ceil(target_n);
    let mut buckets: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0;

    for sentence in &sentences {
        let sentence_len = sentence.chars().count();
        let projected = current_len + if current.is_empty() { 0 } else { 1 } + sentence_len;
        if !current.is_empty() && (projected > limit || current.len() >= per_bucket) {
            buckets.push(current.join(" "));
            current.clear();
            current_len = 0;
        }
        current_len += if current.is_empty() { 0 } else { 1 } + sentence_len;
        current.push(sentence);
    }
    if !current.is_empty() {
        buckets.push(current.join(" "));
    }

    if buckets.len() > 1 {
        let last_len = buckets[buckets.len() - 1].chars().count();
        let prev_len = buckets[buckets.len() - 2].chars().count();
        if last_len < limit / 5 && prev_len + 1 + last_len <= limit {
            let last = buckets.pop().unwrap_or_default();
            if let Some(prev) = buckets.last_mut() {
                prev.push(' ');
                prev.push_str(&last);
            }
        }
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE_SENTENCES: &str = "One is here. Two follows! Three asks? Four continues. Five ends.";

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences(FIVE_SENTENCES);
        assert_eq!(sentences.len(), 5);
        assert_eq!(sentences[0], "One is here.");
        assert_eq!(sentences[4], "Five ends.");
    }

    #[test]
    fn test_split_sentences_trailing_fragment() {
        let sentences = split_sentences("Done. And a tail without punctuation");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[1], "And a tail without punctuation");
    }

    #[test]
    fn test_partition_front_loaded() {
        assert_eq!(partition_front_loaded(7, 3), vec![3, 2, 2]);
        assert_eq!(partition_front_loaded(6, 3), vec![2, 2, 2]);
        assert_eq!(partition_front_loaded(2, 5), vec![1, 1, 0, 0, 0]);
        assert_eq!(partition_front_loaded(0, 3), vec![0, 0, 0]);
        let sizes = partition_front_loaded(13, 4);
        assert_eq!(sizes.iter().sum::<usize>(), 13);
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
    }

    #[test]
    fn test_chunk_balanced_exact_groups() {
        let chunks = chunk_balanced(FIVE_SENTENCES, 3);
        assert_eq!(chunks.len(), 3);
        // Front-loaded: 2, 2, 1 sentences.
        assert_eq!(chunks[0], "One is here. Two follows!");
        assert_eq!(chunks[1], "Three asks? Four continues.");
        assert_eq!(chunks[2], "Five ends.");
        // No sentence duplicated or dropped.
        let rejoined = chunks.join(" ");
        assert_eq!(rejoined, FIVE_SENTENCES);
    }

    #[test]
    fn test_chunk_balanced_fallback_to_char_slicing() {
        // Two sentences but five requested chunks: fall back to slicing.
        let text = "Short one. Short two.";
        let chunks = chunk_balanced(text, 5);
        assert!(!chunks.is_empty());
        assert!(chunks.len() <= 5);
        for chunk in &chunks {
            assert!(!chunk.trim().is_empty());
        }
        // Whole text covered, ignoring whitespace lost at slice edges.
        let compact: String = chunks.concat().chars().filter(|c| !c.is_whitespace()).collect();
        let original: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(compact, original);
    }

    #[test]
    fn test_chunk_balanced_n_one() {
        let chunks = chunk_balanced(FIVE_SENTENCES, 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], FIVE_SENTENCES);
    }

    #[test]
    fn test_chunk_by_limit_respects_limit() {
        let text = "First sentence here. Second sentence there. Third sentence everywhere.";
        for limit in [10, 25, 40, 200] {
            let pieces = chunk_by_limit(text, limit);
            for piece in &pieces {
                assert!(
                    piece.chars().count() <= limit,
                    "piece {:?} exceeds limit {}",
                    piece,
                    limit
                );
            }
            let compact: String = pieces.concat().chars().filter(|c| !c.is_whitespace()).collect();
            let original: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            assert_eq!(compact, original, "content lost at limit {}", limit);
        }
    }

    #[test]
    fn test_chunk_by_limit_prefers_sentence_boundary() {
        let text = "A tiny one. Then a somewhat longer sentence follows here.";
        let pieces = chunk_by_limit(text, 20);
        assert_eq!(pieces[0], "A tiny one.");
    }

    #[test]
    fn test_chunk_by_limit_cuts_mid_word_when_forced() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let pieces = chunk_by_limit(text, 10);
        assert_eq!(pieces, vec!["abcdefghij", "klmnopqrst", "uvwxyz"]);
    }

    #[test]
    fn test_chunk_by_limit_multibyte() {
        let text = "привет мир привет мир привет мир";
        let pieces = chunk_by_limit(text, 12);
        for piece in &pieces {
            assert!(piece.chars().count() <= 12);
        }
    }

    #[test]
    fn test_quota_single_chunk_under_limit() {
        let chunks = chunk_for_quota_backend("short text", 100, 3);
        assert_eq!(chunks, vec!["short text".to_string()]);
    }

    #[test]
    fn test_quota_delegates_when_few_sentences() {
        let long_word = "x".repeat(50);
        let text = format!("{} {} {}", long_word, long_word, long_word);
        let chunks = chunk_for_quota_backend(&text, 60, 5);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 60);
        }
    }

    #[test]
    fn test_quota_buckets_consecutive_sentences() {
        let sentences: Vec<String> = (0..12).map(|i| format!("Sentence number {} here.", i)).collect();
        let text = sentences.join(" ");
        let limit = 200;
        let target = 3;
        let chunks = chunk_for_quota_backend(&text, limit, target);
        assert!(!chunks.is_empty());
        let upper = std::cmp::max(target, text.chars().count().div_ceil(limit));
        assert!(chunks.len() <= upper, "{} chunks > bound {}", chunks.len(), upper);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= limit);
        }
        // Order preserved.
        let compact: String = chunks.join(" ");
        assert_eq!(compact, text);
    }

    #[test]
    fn test_quota_merges_small_final_bucket() {
        // 4 sentences into target 4: per-bucket quota of 1 would leave the
        // tiny last sentence alone; it must fold into its predecessor.
        let text = "A first sentence that is reasonably long. Another first-class sentence right here. A third long enough sentence again. Tiny.";
        let chunks = chunk_for_quota_backend(text, 60, 4);
        assert!(chunks.last().unwrap().contains("Tiny."));
        assert!(chunks.last().unwrap().len() > "Tiny.".len());
    }
}
