//! Strategy-driven text chunker.
//!
//! Splits extracted text into bounded, overlapping [`TextSegment`]s. Four
//! strategies are supported via [`SplitOn`]:
//!
//! | Strategy | Unit | Overlap |
//! |----------|------|---------|
//! | `sentence` (default) | sentences (`.`, `!`, `?`, blank lines) | trailing sentences |
//! | `paragraph` | blank-line separated paragraphs | trailing paragraphs |
//! | `page` | form-feed separated pages | none |
//! | `token` | words, sized by estimated tokens | trailing words |
//!
//! # Algorithm
//!
//! 1. Truncate input above [`MAX_CONTENT_BYTES`] and flag the output.
//! 2. Normalize line endings and whitespace (see [`normalize_whitespace`]).
//! 3. Cut the normalized text into units for the chosen strategy. Units
//!    larger than `max_size` are subdivided (sentences, then words, then
//!    characters).
//! 4. Greedily accumulate units while the buffer stays within `max_size`.
//!    On overflow the buffer is emitted (unless it is still below
//!    `min_size`, in which case it keeps growing) and the next buffer is
//!    seeded with the trailing units that fit in `overlap`.
//! 5. If more than [`MAX_CHUNKS`] segments come out, collapse to a single
//!    truncated segment.
//!
//! Offsets are character offsets into the normalized text, so
//! `normalized.chars().skip(start).take(end - start)` is the segment text.
//!
//! # Example
//!
//! ```rust
//! use ingest_harness_core::chunk::{split, ChunkStrategy};
//!
//! let out = split("First sentence. Second sentence.", &ChunkStrategy::default());
//! assert_eq!(out.segments.len(), 1);
//! assert_eq!(out.segments[0].start, 0);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Hard ceiling on input size. Larger inputs are truncated before chunking.
pub const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;

/// Hard ceiling on segments produced from one input.
pub const MAX_CHUNKS: usize = 1000;

/// Page-break marker used by page mode.
pub const PAGE_BREAK: char = '\u{000C}';

/// Approximate characters-per-token ratio used by the token estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Unit boundary used when splitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitOn {
    #[default]
    Sentence,
    Paragraph,
    Page,
    Token,
}

impl SplitOn {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitOn::Sentence => "sentence",
            SplitOn::Paragraph => "paragraph",
            SplitOn::Page => "page",
            SplitOn::Token => "token",
        }
    }
}

impl fmt::Display for SplitOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitOn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "sentence" => Ok(SplitOn::Sentence),
            "paragraph" => Ok(SplitOn::Paragraph),
            "page" => Ok(SplitOn::Page),
            "token" => Ok(SplitOn::Token),
            other => anyhow::bail!(
                "unknown split strategy: '{}'. Must be sentence, paragraph, page, or token.",
                other
            ),
        }
    }
}

/// Chunking parameters.
///
/// Sizes are in characters, except in [`SplitOn::Token`] mode where they are
/// estimated tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStrategy {
    pub max_size: usize,
    #[serde(default)]
    pub overlap: usize,
    #[serde(default)]
    pub min_size: usize,
    #[serde(default)]
    pub split_on: SplitOn,
}

impl Default for ChunkStrategy {
    fn default() -> Self {
        Self {
            max_size: 1000,
            overlap: 100,
            min_size: 50,
            split_on: SplitOn::Sentence,
        }
    }
}

impl ChunkStrategy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_size == 0 {
            anyhow::bail!("max_size must be > 0");
        }
        if self.overlap >= self.max_size {
            anyhow::bail!(
                "overlap ({}) must be smaller than max_size ({})",
                self.overlap,
                self.max_size
            );
        }
        if self.min_size > self.max_size {
            anyhow::bail!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size,
                self.max_size
            );
        }
        Ok(())
    }

    /// `max_size` expressed in characters.
    fn max_chars(&self) -> usize {
        match self.split_on {
            SplitOn::Token => self.max_size.saturating_mul(CHARS_PER_TOKEN),
            _ => self.max_size,
        }
    }
}

/// One chunk of text with its character offsets in the normalized input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Result of [`split`].
#[derive(Debug, Clone, Default)]
pub struct SplitOutput {
    pub segments: Vec<TextSegment>,
    /// Input was cut at [`MAX_CONTENT_BYTES`] or collapsed at [`MAX_CHUNKS`].
    pub truncated: bool,
    /// Output was collapsed to one segment because of [`MAX_CHUNKS`].
    pub collapsed: bool,
}

/// Split `text` into segments according to `strategy`.
///
/// Never fails: oversized input is truncated and pathological inputs
/// collapse to one segment with a warning.
pub fn split(text: &str, strategy: &ChunkStrategy) -> SplitOutput {
    let mut truncated = false;
    let input = if text.len() > MAX_CONTENT_BYTES {
        warn!(
            bytes = text.len(),
            limit = MAX_CONTENT_BYTES,
            "content exceeds size ceiling, truncating"
        );
        truncated = true;
        &text[..snap_to_char_boundary(text, MAX_CONTENT_BYTES)]
    } else {
        text
    };

    let normalized = normalize_whitespace(input);
    if normalized.is_empty() {
        return SplitOutput {
            segments: Vec::new(),
            truncated,
            collapsed: false,
        };
    }

    let whole = Unit {
        start: 0,
        end: normalized.len(),
        cstart: 0,
        cend: normalized.chars().count(),
    };

    let segments = match strategy.split_on {
        SplitOn::Sentence => sentence_segments(&normalized, whole, strategy),
        SplitOn::Paragraph => {
            let units = expand_oversized(
                &normalized,
                paragraph_units(&normalized, whole),
                strategy.max_size,
            );
            Packer::chars(&normalized, strategy).pack(&units)
        }
        SplitOn::Page => page_segments(&normalized, whole, strategy),
        SplitOn::Token => {
            let units = word_units(&normalized, whole);
            Packer::tokens(&normalized, strategy).pack(&units)
        }
    };

    if segments.len() > MAX_CHUNKS {
        warn!(
            chunks = segments.len(),
            limit = MAX_CHUNKS,
            "chunk count exceeds ceiling, collapsing to a single truncated chunk"
        );
        let keep = strategy.max_chars().min(whole.cend);
        let end_byte = normalized
            .char_indices()
            .nth(keep)
            .map(|(i, _)| i)
            .unwrap_or(normalized.len());
        return SplitOutput {
            segments: vec![TextSegment {
                text: normalized[..end_byte].to_string(),
                start: 0,
                end: keep,
            }],
            truncated: true,
            collapsed: true,
        };
    }

    SplitOutput {
        segments,
        truncated,
        collapsed: false,
    }
}

/// Normalize line endings and whitespace.
///
/// - `\r\n` and `\r` become `\n`.
/// - Runs of spaces/tabs inside a line collapse to one space; lines are trimmed.
/// - Any run of blank lines collapses to a single blank line (`\n\n`).
/// - Page breaks (`\u{000C}`) are preserved.
pub fn normalize_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = false;

    for line in unified.split('\n') {
        let collapsed = collapse_line(line);
        if collapsed.is_empty() {
            blank_run = true;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run { "\n\n" } else { "\n" });
        }
        blank_run = false;
        out.push_str(&collapsed);
    }

    out
}

fn collapse_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut pending_space = false;
    for c in line.chars() {
        if c == PAGE_BREAK {
            out.push(c);
            pending_space = false;
        } else if c.is_whitespace() {
            pending_space = true;
        } else {
            if pending_space && !out.is_empty() && !out.ends_with(PAGE_BREAK) {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        }
    }
    out
}

/// Rough token estimate: the mean of a character-based and a word-based
/// estimate, `ceil((ceil(chars / 4) + ceil(words * 1.3)) / 2)`.
pub fn estimate_tokens(text: &str) -> usize {
    estimate_from_counts(text.chars().count(), text.split_whitespace().count())
}

fn estimate_from_counts(chars: usize, words: usize) -> usize {
    let by_chars = chars.div_ceil(CHARS_PER_TOKEN);
    let by_words = (words * 13).div_ceil(10);
    (by_chars + by_words).div_ceil(2)
}

/// SHA-256 of the trimmed, lower-cased content. Used for exact dedup only.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.trim().to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ═══════════════════════════════════════════════════════════════════════
// Units
// ═══════════════════════════════════════════════════════════════════════

/// A span of the normalized text, in both byte and char offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unit {
    start: usize,
    end: usize,
    cstart: usize,
    cend: usize,
}

impl Unit {
    fn chars(&self) -> usize {
        self.cend - self.cstart
    }
}

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '\u{201D}' | '\u{2019}')
}

/// Scan `range` of `text`, cutting wherever `boundary(prev_terminal, c, next)`
/// says a unit ends after `c`. Units are trimmed of surrounding whitespace.
fn scan_units<F>(text: &str, range: Unit, mut boundary: F) -> Vec<Unit>
where
    F: FnMut(bool, char, Option<char>) -> bool,
{
    let slice = &text[range.start..range.end];
    let mut iter = slice.char_indices().peekable();
    let mut units = Vec::new();
    let mut ci = range.cstart;
    let mut start: Option<(usize, usize)> = None;
    let mut last_non_ws = (range.start, range.cstart);
    let mut prev_terminal = false;

    while let Some((b, c)) = iter.next() {
        let abs = range.start + b;
        let next = iter.peek().map(|&(_, n)| n);
        if !c.is_whitespace() {
            if start.is_none() {
                start = Some((abs, ci));
            }
            last_non_ws = (abs + c.len_utf8(), ci + 1);
        }
        ci += 1;

        let ends = boundary(prev_terminal, c, next);
        prev_terminal = is_terminal(c) || (is_closer(c) && prev_terminal);

        if ends {
            if let Some((s, cs)) = start.take() {
                units.push(Unit {
                    start: s,
                    end: last_non_ws.0,
                    cstart: cs,
                    cend: last_non_ws.1,
                });
            }
        }
    }

    if let Some((s, cs)) = start {
        units.push(Unit {
            start: s,
            end: last_non_ws.0,
            cstart: cs,
            cend: last_non_ws.1,
        });
    }

    units
}

/// Sentences end at terminal punctuation (optionally followed by closing
/// quotes/brackets) before whitespace, and at blank lines.
fn sentence_units(text: &str, range: Unit) -> Vec<Unit> {
    scan_units(text, range, |prev_terminal, c, next| {
        let at_gap = next.map_or(true, char::is_whitespace);
        if (is_terminal(c) || (is_closer(c) && prev_terminal)) && at_gap {
            return true;
        }
        c == '\n' && next == Some('\n')
    })
}

fn paragraph_units(text: &str, range: Unit) -> Vec<Unit> {
    scan_units(text, range, |_, c, next| c == '\n' && next == Some('\n'))
}

fn word_units(text: &str, range: Unit) -> Vec<Unit> {
    scan_units(text, range, |_, c, next| {
        !c.is_whitespace() && next.map_or(true, char::is_whitespace)
    })
}

// The page break is whitespace, so it never lands inside a trimmed unit.
fn page_units(text: &str, range: Unit) -> Vec<Unit> {
    scan_units(text, range, |_, c, _| c == PAGE_BREAK)
}

/// Subdivide units longer than `max_chars`: paragraphs into sentences,
/// sentences into word groups, single long words into character slices.
fn expand_oversized(text: &str, units: Vec<Unit>, max_chars: usize) -> Vec<Unit> {
    let mut out = Vec::with_capacity(units.len());
    for unit in units {
        if unit.chars() <= max_chars {
            out.push(unit);
            continue;
        }
        let sentences = sentence_units(text, unit);
        if sentences.len() > 1 {
            out.extend(expand_oversized(text, sentences, max_chars));
        } else {
            out.extend(split_words(text, unit, max_chars));
        }
    }
    out
}

fn split_words(text: &str, unit: Unit, max_chars: usize) -> Vec<Unit> {
    let mut pieces: Vec<Unit> = Vec::new();
    for word in word_units(text, unit) {
        if word.chars() > max_chars {
            pieces.extend(split_chars(text, word, max_chars));
            continue;
        }
        match pieces.last_mut() {
            Some(last) if word.cend - last.cstart <= max_chars => {
                last.end = word.end;
                last.cend = word.cend;
            }
            _ => pieces.push(word),
        }
    }
    pieces
}

fn split_chars(text: &str, unit: Unit, max_chars: usize) -> Vec<Unit> {
    let slice = &text[unit.start..unit.end];
    let mut pieces = Vec::new();
    let mut piece_start = (unit.start, unit.cstart);
    let mut count = 0;
    for (b, _) in slice.char_indices() {
        if count == max_chars {
            let abs = unit.start + b;
            pieces.push(Unit {
                start: piece_start.0,
                end: abs,
                cstart: piece_start.1,
                cend: piece_start.1 + count,
            });
            piece_start = (abs, piece_start.1 + count);
            count = 0;
        }
        count += 1;
    }
    if count > 0 {
        pieces.push(Unit {
            start: piece_start.0,
            end: unit.end,
            cstart: piece_start.1,
            cend: piece_start.1 + count,
        });
    }
    pieces
}

// ═══════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════

fn sentence_segments(text: &str, range: Unit, strategy: &ChunkStrategy) -> Vec<TextSegment> {
    let slice = &text[range.start..range.end];
    if !slice.contains(is_terminal) {
        return vec![segment(text, range, range)];
    }
    let units = expand_oversized(text, sentence_units(text, range), strategy.max_size);
    Packer::chars(text, strategy).pack(&units)
}

/// One segment per page. Pages below `min_size` merge into the following
/// page; pages above `max_size` are split in sentence mode.
fn page_segments(text: &str, range: Unit, strategy: &ChunkStrategy) -> Vec<TextSegment> {
    let pages = page_units(text, range);
    let mut out = Vec::with_capacity(pages.len());
    let mut carry: Option<Unit> = None;

    for (i, page) in pages.iter().enumerate() {
        let is_last = i + 1 == pages.len();
        let merged = match carry {
            Some(c) => Unit {
                start: c.start,
                end: page.end,
                cstart: c.cstart,
                cend: page.cend,
            },
            None => *page,
        };

        if merged.chars() <= strategy.max_size {
            if merged.chars() < strategy.min_size && !is_last {
                carry = Some(merged);
                continue;
            }
            out.push(segment(text, merged, merged));
            carry = None;
            continue;
        }

        if let Some(c) = carry.take() {
            out.push(segment(text, c, c));
        }
        out.extend(sentence_segments(text, *page, strategy));
    }

    if let Some(c) = carry {
        out.push(segment(text, c, c));
    }
    out
}

fn segment(text: &str, first: Unit, last: Unit) -> TextSegment {
    TextSegment {
        text: text[first.start..last.end].to_string(),
        start: first.cstart,
        end: last.cend,
    }
}

#[derive(Clone, Copy)]
enum Measure {
    Chars,
    Tokens,
}

/// Greedy accumulate-and-overflow packer shared by the unit-based strategies.
struct Packer<'a> {
    text: &'a str,
    max: usize,
    overlap: usize,
    min: usize,
    measure: Measure,
}

impl<'a> Packer<'a> {
    fn chars(text: &'a str, strategy: &ChunkStrategy) -> Self {
        Self {
            text,
            max: strategy.max_size,
            overlap: strategy.overlap,
            min: strategy.min_size,
            measure: Measure::Chars,
        }
    }

    fn tokens(text: &'a str, strategy: &ChunkStrategy) -> Self {
        Self {
            measure: Measure::Tokens,
            ..Self::chars(text, strategy)
        }
    }

    fn size(&self, units: &[Unit]) -> usize {
        let (Some(first), Some(last)) = (units.first(), units.last()) else {
            return 0;
        };
        let chars = last.cend - first.cstart;
        match self.measure {
            Measure::Chars => chars,
            Measure::Tokens => estimate_from_counts(chars, units.len()),
        }
    }

    fn pack(&self, units: &[Unit]) -> Vec<TextSegment> {
        let mut out = Vec::new();
        if units.is_empty() {
            return out;
        }

        let (mut lo, mut hi) = (0usize, 1usize);
        for i in 1..units.len() {
            if self.size(&units[lo..=i]) <= self.max {
                hi = i + 1;
                continue;
            }
            if self.size(&units[lo..hi]) < self.min {
                hi = i + 1;
                continue;
            }

            out.push(segment(self.text, units[lo], units[hi - 1]));

            let mut k = hi;
            while k > lo + 1 && self.size(&units[k - 1..hi]) <= self.overlap {
                k -= 1;
            }
            lo = k;
            hi = i + 1;
            while hi - lo > 1 && self.size(&units[lo..hi]) > self.max {
                lo += 1;
            }
        }

        out.push(segment(self.text, units[lo], units[hi - 1]));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(max: usize, overlap: usize, min: usize, split_on: SplitOn) -> ChunkStrategy {
        ChunkStrategy {
            max_size: max,
            overlap,
            min_size: min,
            split_on,
        }
    }

    fn numbered_sentences(n: usize) -> String {
        (0..n)
            .map(|i| format!("This is sentence number {}.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn assert_offsets_match(text: &str, out: &SplitOutput) {
        let normalized = normalize_whitespace(text);
        for seg in &out.segments {
            let expected: String = normalized
                .chars()
                .skip(seg.start)
                .take(seg.end - seg.start)
                .collect();
            assert_eq!(seg.text, expected);
        }
    }

    #[test]
    fn empty_input_yields_no_segments() {
        assert!(split("", &ChunkStrategy::default()).segments.is_empty());
        assert!(split("  \n\t \r\n", &ChunkStrategy::default())
            .segments
            .is_empty());
    }

    #[test]
    fn exact_max_size_without_punctuation_is_one_chunk() {
        let body = "word ".repeat(200);
        let text = format!("  {}  ", body.trim());
        let max = text.trim().chars().count();
        let out = split(&text, &strategy(max, 10, 0, SplitOn::Sentence));
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].text, text.trim());
    }

    #[test]
    fn no_punctuation_is_never_split() {
        let text = "lorem ipsum ".repeat(500);
        let out = split(&text, &strategy(100, 10, 0, SplitOn::Sentence));
        assert_eq!(out.segments.len(), 1);
        assert!(!out.truncated);
    }

    #[test]
    fn sentence_mode_respects_max_size() {
        let text = numbered_sentences(100);
        let out = split(&text, &strategy(120, 30, 0, SplitOn::Sentence));
        assert!(out.segments.len() > 1);
        for seg in &out.segments {
            assert!(seg.text.chars().count() <= 120, "too long: {}", seg.text);
        }
        assert_offsets_match(&text, &out);
    }

    #[test]
    fn sentence_mode_covers_input_without_gaps() {
        let text = numbered_sentences(60);
        let normalized = normalize_whitespace(&text);
        let out = split(&text, &strategy(150, 40, 0, SplitOn::Sentence));

        let total = normalized.chars().count();
        let mut covered = vec![false; total];
        for seg in &out.segments {
            for slot in covered.iter_mut().take(seg.end).skip(seg.start) {
                *slot = true;
            }
        }
        for (i, c) in normalized.chars().enumerate() {
            if !c.is_whitespace() {
                assert!(covered[i], "char {} ({:?}) not covered", i, c);
            }
        }
        assert_eq!(out.segments.first().unwrap().start, 0);
        assert_eq!(out.segments.last().unwrap().end, total);
    }

    #[test]
    fn overlap_is_bounded() {
        let text = numbered_sentences(80);
        let overlap = 60;
        let out = split(&text, &strategy(200, overlap, 0, SplitOn::Sentence));
        for pair in out.segments.windows(2) {
            let shared = pair[0].end.saturating_sub(pair[1].start);
            assert!(shared <= overlap, "shared {} > {}", shared, overlap);
            assert!(pair[1].start >= pair[0].start);
        }
        let any_overlap = out
            .segments
            .windows(2)
            .any(|pair| pair[0].end > pair[1].start);
        assert!(any_overlap, "expected some overlap between chunks");
    }

    #[test]
    fn zero_overlap_produces_disjoint_chunks() {
        let text = numbered_sentences(40);
        let out = split(&text, &strategy(100, 0, 0, SplitOn::Sentence));
        for pair in out.segments.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn min_size_keeps_accumulating() {
        let text = "Aa. Bb. Cc. Dd. Ee. Ff.";
        let loose = split(text, &strategy(8, 0, 0, SplitOn::Sentence));
        let strict = split(text, &strategy(8, 0, 8, SplitOn::Sentence));
        assert!(strict.segments.len() < loose.segments.len());
        for seg in &strict.segments[..strict.segments.len() - 1] {
            assert!(seg.text.chars().count() >= 8);
        }
    }

    #[test]
    fn oversized_sentence_is_split_on_words() {
        let long = format!("{}.", "alpha beta gamma delta ".repeat(20).trim());
        let text = format!("Short one. {} Another short one.", long);
        let out = split(&text, &strategy(50, 0, 0, SplitOn::Sentence));
        for seg in &out.segments {
            assert!(seg.text.chars().count() <= 50);
        }
        assert_offsets_match(&text, &out);
    }

    #[test]
    fn paragraph_mode_splits_on_blank_lines() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\n\n\nThird paragraph here.";
        let out = split(text, &strategy(30, 0, 0, SplitOn::Paragraph));
        assert_eq!(out.segments.len(), 3);
        assert_eq!(out.segments[0].text, "First paragraph here.");
        assert_eq!(out.segments[2].text, "Third paragraph here.");
        assert_offsets_match(text, &out);
    }

    #[test]
    fn paragraph_mode_accumulates_small_paragraphs() {
        let text = "One.\n\nTwo.\n\nThree.";
        let out = split(text, &strategy(100, 0, 0, SplitOn::Paragraph));
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].text, "One.\n\nTwo.\n\nThree.");
    }

    #[test]
    fn page_mode_emits_one_chunk_per_page() {
        let text = "Page one text.\u{000C}Page two text.\u{000C}Page three text.";
        let out = split(text, &strategy(100, 0, 0, SplitOn::Page));
        let texts: Vec<_> = out.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Page one text.", "Page two text.", "Page three text."]);
        assert_offsets_match(text, &out);
    }

    #[test]
    fn page_mode_splits_oversized_pages() {
        let big = numbered_sentences(20);
        let text = format!("Cover.\u{000C}{}", big);
        let out = split(&text, &strategy(80, 0, 0, SplitOn::Page));
        assert_eq!(out.segments[0].text, "Cover.");
        assert!(out.segments.len() > 2);
        for seg in &out.segments {
            assert!(seg.text.chars().count() <= 80);
        }
    }

    #[test]
    fn page_mode_merges_tiny_pages_forward() {
        let text = "A.\u{000C}This page is long enough.";
        let out = split(text, &strategy(100, 0, 5, SplitOn::Page));
        assert_eq!(out.segments.len(), 1);
        assert!(out.segments[0].text.starts_with("A."));
        assert!(out.segments[0].text.ends_with("long enough."));
    }

    #[test]
    fn token_mode_bounds_estimated_tokens() {
        let text = "the quick brown fox jumps over the lazy dog ".repeat(40);
        let out = split(&text, &strategy(30, 5, 0, SplitOn::Token));
        assert!(out.segments.len() > 1);
        for seg in &out.segments {
            assert!(estimate_tokens(&seg.text) <= 30, "{}", seg.text);
        }
        assert_offsets_match(&text, &out);
    }

    #[test]
    fn chunk_count_ceiling_collapses() {
        let text = numbered_sentences(3000);
        let out = split(&text, &strategy(30, 0, 0, SplitOn::Sentence));
        assert_eq!(out.segments.len(), 1);
        assert!(out.truncated);
        assert!(out.collapsed);
        assert_eq!(out.segments[0].text.chars().count(), 30);
    }

    #[test]
    fn content_ceiling_truncates() {
        let text = "ab ".repeat(MAX_CONTENT_BYTES / 3 + 1000);
        assert!(text.len() > MAX_CONTENT_BYTES);
        let out = split(&text, &strategy(1000, 0, 0, SplitOn::Sentence));
        assert!(out.truncated);
        assert_eq!(out.segments.len(), 1);
        assert!(out.segments[0].text.len() <= MAX_CONTENT_BYTES);
    }

    #[test]
    fn multibyte_text_keeps_char_offsets() {
        let text = "Ünïcödé sentence one. 日本語の文です。Second - sentence two! Third?";
        let out = split(text, &strategy(25, 0, 0, SplitOn::Sentence));
        assert!(!out.segments.is_empty());
        assert_offsets_match(text, &out);
    }

    #[test]
    fn normalize_collapses_whitespace() {
        let text = "  Hello \t  world \r\nnext\r\n\r\n\r\n\r\nlast  ";
        assert_eq!(normalize_whitespace(text), "Hello world\nnext\n\nlast");
    }

    #[test]
    fn token_estimate_formula() {
        assert_eq!(estimate_tokens(""), 0);
        // chars 11 -> 3, words 2 -> ceil(2.6) = 3, mean 3
        assert_eq!(estimate_tokens("hello world"), 3);
        // chars 43 -> 11, words 9 -> ceil(11.7) = 12, ceil(23 / 2) = 12
        assert_eq!(
            estimate_tokens("the quick brown fox jumps over the lazy dog"),
            12
        );
    }

    #[test]
    fn hash_ignores_case_and_outer_whitespace() {
        assert_eq!(content_hash("  Hello World \n"), content_hash("hello world"));
        assert_ne!(content_hash("hello world"), content_hash("hello  world"));
    }

    #[test]
    fn strategy_validation() {
        assert!(ChunkStrategy::default().validate().is_ok());
        assert!(strategy(0, 0, 0, SplitOn::Sentence).validate().is_err());
        assert!(strategy(10, 10, 0, SplitOn::Sentence).validate().is_err());
        assert!(strategy(10, 2, 11, SplitOn::Sentence).validate().is_err());
    }

    #[test]
    fn deterministic() {
        let text = numbered_sentences(30);
        let a = split(&text, &ChunkStrategy::default());
        let b = split(&text, &ChunkStrategy::default());
        assert_eq!(a.segments, b.segments);
    }
}
