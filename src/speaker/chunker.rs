//! Punctuation-aware chunking of streamed text for speech synthesis.
//!
//! Text arrives a few characters at a time; the chunker closes a chunk on
//! sentence punctuation, on clause punctuation once the chunk is long
//! enough, when the word budget runs out, or when the orchestrator injects
//! a flush/special sentinel. The first `boost` chunks are released at the
//! first boundary of any kind to get audio started quickly.

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;

use super::tokens::{strip_sentinels, FLUSH_SENTINEL, SPECIAL_SENTINEL};

const HARD: &[char] = &[
    '.', '。', '?', '？', '!', '！', '…', '⋯', '～', '~', '\n', '\t', '\r',
];
const SOFT: &[char] = &[
    ',', '，', '、', '–', '—', ':', '：', ';', '；', '《', '》', '「', '」',
];
const KEPT: &[char] = &['?', '？', '!', '！'];

const ELLIPSIS: &str = "…";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChunkerOptions {
    /// Chunks released eagerly at any boundary
    pub boost: usize,
    /// Chunks past the boost stage never close with fewer words, except
    /// on sentence punctuation or at the end of the input
    pub minimum_words: usize,
    /// Hard word budget per chunk
    pub maximum_words: usize,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            boost: 2,
            minimum_words: 4,
            maximum_words: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReason {
    Boost,
    Limit,
    Hard,
    Flush,
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub words: usize,
    pub reason: ChunkReason,
}

/// Word-like units in `text`; punctuation and whitespace do not count.
pub fn count_words(text: &str) -> usize {
    text.unicode_words().count()
}

fn single_char(g: &str) -> Option<char> {
    let mut chars = g.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

fn is_hard(g: &str) -> bool {
    g == "\r\n" || single_char(g).is_some_and(|c| HARD.contains(&c))
}

fn is_soft(g: &str) -> bool {
    single_char(g).is_some_and(|c| SOFT.contains(&c))
}

fn is_kept(g: &str) -> bool {
    single_char(g).is_some_and(|c| KEPT.contains(&c))
}

fn is_sentinel(g: &str, sentinel: char) -> bool {
    single_char(g) == Some(sentinel)
}

fn is_digit(g: &str) -> bool {
    g.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn ends_with_digit(g: &str) -> bool {
    g.chars().last().is_some_and(|c| c.is_ascii_digit())
}

/// Incremental chunker. Feed it with [`push`](Self::push) and close the
/// input with [`finish`](Self::finish).
#[derive(Debug)]
pub struct SemanticChunker {
    options: ChunkerOptions,
    /// Trailing grapheme of the last push; may still grow
    carry: String,
    /// Complete graphemes waiting for lookahead
    queue: VecDeque<String>,
    /// Text since the last boundary
    buffer: String,
    /// Text of the chunk being built
    chunk: String,
    chunk_words: usize,
    emitted: usize,
    previous: Option<String>,
}

impl Default for SemanticChunker {
    fn default() -> Self {
        Self::new(ChunkerOptions::default())
    }
}

impl SemanticChunker {
    pub fn new(options: ChunkerOptions) -> Self {
        Self {
            options,
            carry: String::new(),
            queue: VecDeque::new(),
            buffer: String::new(),
            chunk: String::new(),
            chunk_words: 0,
            emitted: 0,
            previous: None,
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<Chunk> {
        self.carry.push_str(text);
        let mut graphemes: Vec<String> = self
            .carry
            .graphemes(true)
            .map(str::to_string)
            .collect();
        // The last cluster may be extended by the next push. Sentinels are
        // control characters and always stand alone.
        let held = graphemes
            .last()
            .is_some_and(|g| !is_sentinel(g, FLUSH_SENTINEL) && !is_sentinel(g, SPECIAL_SENTINEL));
        self.carry = if held {
            graphemes.pop().unwrap_or_default()
        } else {
            String::new()
        };
        self.queue.extend(graphemes);
        self.drain(false)
    }

    /// Close the input: process everything held back and emit the rest.
    /// The chunker starts over afterwards.
    pub fn finish(&mut self) -> Vec<Chunk> {
        let carry = std::mem::take(&mut self.carry);
        self.queue
            .extend(carry.graphemes(true).map(str::to_string));
        let mut out = self.drain(true);
        self.enforce_budget(&mut out, None);

        let words = self.chunk_words + count_words(&self.buffer);
        self.chunk.push_str(&self.buffer);
        let text = self.chunk.trim().to_string();
        if !text.is_empty() {
            out.push(Chunk {
                text,
                words,
                reason: ChunkReason::Flush,
            });
        }

        *self = Self::new(self.options);
        out
    }

    /// Whether the head of the queue has the lookahead it needs.
    fn ready(&self, last: bool) -> bool {
        if last {
            return true;
        }
        match self.queue.front().map(String::as_str) {
            Some(".") => match self.queue.get(1).map(String::as_str) {
                None => false,
                Some(".") => self.queue.len() >= 3,
                Some(_) => true,
            },
            Some(",") => {
                let after_digit = self.previous.as_deref().is_some_and(ends_with_digit);
                !after_digit || self.queue.len() >= 2
            }
            _ => true,
        }
    }

    fn drain(&mut self, last: bool) -> Vec<Chunk> {
        let mut out = Vec::new();
        while !self.queue.is_empty() && self.ready(last) {
            let Some(mut value) = self.queue.pop_front() else {
                break;
            };

            if value == "." || value == "," {
                let after_digit = self.previous.as_deref().is_some_and(ends_with_digit);
                let before_digit = self.queue.front().is_some_and(|g| is_digit(g));
                if after_digit && before_digit {
                    // Decimal point or thousands separator
                    self.buffer.push_str(&value);
                    self.previous = Some(value);
                    continue;
                }
                if value == "."
                    && self.queue.front().is_some_and(|g| g == ".")
                    && self.queue.get(1).is_some_and(|g| g == ".")
                {
                    self.queue.pop_front();
                    self.queue.pop_front();
                    value = ELLIPSIS.to_string();
                }
            }

            self.step(value, &mut out);
        }
        out
    }

    fn step(&mut self, value: String, out: &mut Vec<Chunk>) {
        let flush = is_sentinel(&value, FLUSH_SENTINEL);
        let special = is_sentinel(&value, SPECIAL_SENTINEL);
        let hard = is_hard(&value);
        let soft = is_soft(&value);

        if !(flush || special || hard || soft) {
            if value.chars().all(char::is_whitespace) {
                self.enforce_budget(out, None);
            }
            self.buffer.push_str(&value);
            self.previous = Some(value);
            return;
        }

        if self.buffer.is_empty() {
            if special {
                // Announces a control token; carries whatever chunk is open.
                let text = self.chunk.trim().to_string();
                let words = self.chunk_words;
                self.emit(out, text, words, ChunkReason::Special);
            } else if (flush || hard) && !self.chunk.trim().is_empty() {
                let text = self.chunk.trim().to_string();
                let words = self.chunk_words;
                let reason = if flush { ChunkReason::Flush } else { ChunkReason::Hard };
                self.emit(out, text, words, reason);
            }
            self.previous = Some(value);
            return;
        }

        self.enforce_budget(out, Some(&value));
        let words = count_words(&self.buffer);
        self.chunk.push_str(&self.buffer);
        if !(flush || special) {
            self.chunk.push_str(&value);
        }
        self.chunk_words += words;
        self.buffer.clear();

        let reason = if special {
            Some(ChunkReason::Special)
        } else if flush {
            Some(ChunkReason::Flush)
        } else if hard {
            Some(ChunkReason::Hard)
        } else if self.chunk_words >= self.options.maximum_words.max(1) {
            Some(ChunkReason::Limit)
        } else if self.emitted < self.options.boost {
            Some(ChunkReason::Boost)
        } else {
            None
        };

        if let Some(reason) = reason {
            let text = self.chunk.trim().to_string();
            let words = self.chunk_words;
            self.emit(out, text, words, reason);
        }
        self.previous = Some(value);
    }

    /// Keep the open chunk plus the buffer within the word budget.
    ///
    /// A chunk that already holds `minimum_words` is closed as it stands.
    /// A shorter one is topped up from the buffer to exactly
    /// `maximum_words`, splitting the buffer after a word. `boundary` is
    /// the clause punctuation about to close the buffer, if any.
    fn enforce_budget(&mut self, out: &mut Vec<Chunk>, boundary: Option<&str>) {
        let maximum = self.options.maximum_words.max(1);
        let minimum = self.options.minimum_words.clamp(1, maximum);
        loop {
            let words = count_words(&self.buffer);
            if self.chunk_words + words <= maximum {
                return;
            }

            if self.chunk_words >= minimum {
                let mut text = self.chunk.trim().to_string();
                if let Some(kept) = boundary.filter(|g| is_kept(g)) {
                    text.truncate(text.trim_end_matches(SOFT).len());
                    text.push_str(kept);
                }
                let chunk_words = self.chunk_words;
                self.emit(out, text, chunk_words, ChunkReason::Limit);
                continue;
            }

            // chunk_words < minimum <= maximum, so at least one word moves
            let take = maximum - self.chunk_words;
            let end = self
                .buffer
                .unicode_word_indices()
                .nth(take - 1)
                .map_or(self.buffer.len(), |(at, word)| at + word.len());
            let rest = self.buffer.split_off(end);
            self.chunk.push_str(&self.buffer);
            self.buffer = rest;
            let text = self.chunk.trim().to_string();
            self.emit(out, text, maximum, ChunkReason::Limit);
        }
    }

    fn emit(&mut self, out: &mut Vec<Chunk>, text: String, words: usize, reason: ChunkReason) {
        debug!("Chunk #{} ({reason:?}, {words} words): {text:?}", self.emitted);
        out.push(Chunk {
            text,
            words,
            reason,
        });
        self.emitted += 1;
        self.chunk.clear();
        self.chunk_words = 0;
    }
}

/// Pull-based chunk iterator over a source of text fragments.
pub struct Chunks<I> {
    source: I,
    chunker: SemanticChunker,
    ready: VecDeque<Chunk>,
    done: bool,
}

impl<I, S> Iterator for Chunks<I>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(chunk);
            }
            if self.done {
                return None;
            }
            match self.source.next() {
                Some(fragment) => self.ready.extend(self.chunker.push(fragment.as_ref())),
                None => {
                    self.done = true;
                    self.ready.extend(self.chunker.finish());
                }
            }
        }
    }
}

/// Chunk a sequence of fragments lazily.
pub fn chunks<I, S>(source: I, options: ChunkerOptions) -> Chunks<I::IntoIter>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Chunks {
        source: source.into_iter(),
        chunker: SemanticChunker::new(options),
        ready: VecDeque::new(),
        done: false,
    }
}

/// Chunk a complete string.
pub fn chunk_text(text: &str, options: ChunkerOptions) -> Vec<Chunk> {
    chunks(std::iter::once(text), options).collect()
}

/// Speakable text handed to synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsChunkItem {
    /// Sentinel-free text; may be empty for a bare control token
    pub chunk: String,
    /// Raw control token this chunk closes on
    pub special: Option<String>,
}

/// Turns chunks into [`TtsChunkItem`]s, pairing each special chunk with
/// the control token announced for it.
#[derive(Debug, Default)]
pub struct ChunkEmitter {
    specials: VecDeque<String>,
}

impl ChunkEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the raw token for the next special chunk.
    pub fn push_special(&mut self, raw: impl Into<String>) {
        self.specials.push_back(raw.into());
    }

    pub fn pending_specials(&self) -> usize {
        self.specials.len()
    }

    pub fn emit(&mut self, chunk: Chunk) -> TtsChunkItem {
        let special = if chunk.reason == ChunkReason::Special {
            let raw = self.specials.pop_front();
            if raw.is_none() {
                warn!("Special chunk without a pending control token");
            }
            raw
        } else {
            None
        };

        TtsChunkItem {
            chunk: strip_sentinels(&chunk.text),
            special,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn test_decimals_are_not_split() {
        let chunks = chunk_text("Value is 3.14 and 2.5 ok.", ChunkerOptions::default());
        assert!(chunks.iter().any(|c| c.text.contains("3.14")));
        assert!(chunks.iter().any(|c| c.text.contains("2.5")));
        assert_eq!(texts(&chunks), vec!["Value is 3.14 and 2.5 ok."]);
        assert_eq!(chunks[0].reason, ChunkReason::Hard);
    }

    #[test]
    fn test_thousands_separator_is_kept() {
        let chunks = chunk_text("It costs 1,000 dollars.", ChunkerOptions::default());
        assert_eq!(texts(&chunks), vec!["It costs 1,000 dollars."]);
    }

    #[test]
    fn test_decimal_split_across_pushes() {
        let mut chunker = SemanticChunker::default();
        let mut out = chunker.push("Pi is 3");
        out.extend(chunker.push("."));
        out.extend(chunker.push("14 exactly."));
        out.extend(chunker.finish());
        assert_eq!(texts(&out), vec!["Pi is 3.14 exactly."]);
    }

    #[test]
    fn test_ellipsis_is_one_boundary() {
        let chunks = chunk_text("Wait... really?", ChunkerOptions::default());
        assert_eq!(texts(&chunks), vec!["Wait…", "really?"]);
        assert_eq!(chunks[0].reason, ChunkReason::Hard);
    }

    #[test]
    fn test_ellipsis_split_across_pushes() {
        let mut chunker = SemanticChunker::default();
        let mut out = Vec::new();
        for piece in ["Hm", ".", ".", ".", " ok", "."] {
            out.extend(chunker.push(piece));
        }
        out.extend(chunker.finish());
        assert_eq!(texts(&out), vec!["Hm…", "ok."]);
    }

    #[test]
    fn test_boost_releases_short_clauses() {
        let chunks = chunk_text(
            "Well, so, then we talk about it later, maybe",
            ChunkerOptions::default(),
        );
        assert_eq!(chunks[0].text, "Well,");
        assert_eq!(chunks[0].reason, ChunkReason::Boost);
        assert_eq!(chunks[1].text, "so,");
        assert_eq!(chunks[1].reason, ChunkReason::Boost);
        assert_eq!(chunks[2].text, "then we talk about it later, maybe");
        assert_eq!(chunks[2].reason, ChunkReason::Flush);
    }

    #[test]
    fn test_soft_break_respects_word_budget() {
        let options = ChunkerOptions {
            boost: 0,
            ..ChunkerOptions::default()
        };
        let chunks = chunk_text(
            "one two three four five six, seven eight nine ten eleven twelve thirteen, end",
            options,
        );
        assert_eq!(chunks[0].text, "one two three four five six,");
        assert_eq!(chunks[0].reason, ChunkReason::Limit);
        assert_eq!(chunks[0].words, 6);
        assert_eq!(chunks[1].text, "seven eight nine ten eleven twelve thirteen, end");
    }

    #[test]
    fn test_kept_punctuation_on_limit_split() {
        let options = ChunkerOptions {
            boost: 0,
            minimum_words: 1,
            maximum_words: 4,
        };
        let chunks = chunk_text("one two three, four five?", options);
        assert_eq!(chunks[0].text, "one two three?");
        assert_eq!(chunks[0].reason, ChunkReason::Limit);
        assert_eq!(chunks[1].text, "four five?");
        assert_eq!(chunks[1].reason, ChunkReason::Hard);
    }

    /// Word bounds every chunk must respect when no sentence punctuation
    /// intervenes: never above the budget, and never below the minimum
    /// once the boost chunks are out, except for the tail.
    fn assert_word_bounds(chunks: &[Chunk], options: ChunkerOptions, input: &str) {
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.words, count_words(&chunk.text), "{chunk:?}");
            assert!(
                chunk.words <= options.maximum_words,
                "chunk {i} over budget for {input:?}: {chunk:?}"
            );
            if i >= options.boost && i < last {
                assert!(
                    chunk.words >= options.minimum_words,
                    "chunk {i} too short for {input:?}: {chunk:?}"
                );
            }
        }
        let total: usize = chunks.iter().map(|c| c.words).sum();
        assert_eq!(total, count_words(input));
    }

    #[test]
    fn test_chunk_word_bounds_on_random_clauses() {
        let separators = [" ", ", ", "; ", ": ", "、"];
        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let options = ChunkerOptions {
                boost: rng.gen_range(0..=2),
                minimum_words: rng.gen_range(1..=5),
                maximum_words: rng.gen_range(6..=14),
            };

            let mut text = String::new();
            for n in 0..rng.gen_range(1..=80) {
                if n > 0 {
                    let separator = if rng.gen_bool(0.25) {
                        separators[rng.gen_range(1..separators.len())]
                    } else {
                        separators[0]
                    };
                    text.push_str(separator);
                }
                text.push_str(&format!("w{n}"));
            }

            assert_word_bounds(&chunk_text(&text, options), options, &text);

            // Same input delivered in small pieces.
            let pieces: Vec<String> = text
                .chars()
                .collect::<Vec<_>>()
                .chunks(rng.gen_range(1..=7))
                .map(|c| c.iter().collect())
                .collect();
            let streamed: Vec<Chunk> = chunks(pieces, options).collect();
            assert_word_bounds(&streamed, options, &text);
        }
    }

    #[test]
    fn test_short_clause_is_topped_up_before_long_run() {
        let run = (1..=20).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let text = format!("Hi, there, a b c, {run}");
        let options = ChunkerOptions::default();
        let chunks = chunk_text(&text, options);

        assert_eq!(texts(&chunks[..2]), vec!["Hi,", "there,"]);
        assert_eq!(chunks[2].text, "a b c, w1 w2 w3 w4 w5 w6 w7 w8 w9");
        assert_eq!(chunks[2].words, 12);
        assert_eq!(chunks[2].reason, ChunkReason::Limit);
        assert_eq!(chunks[3].reason, ChunkReason::Flush);
        assert_word_bounds(&chunks, options, &text);
    }

    #[test]
    fn test_short_chunk_never_folds_past_budget() {
        let options = ChunkerOptions {
            boost: 0,
            ..ChunkerOptions::default()
        };
        let text = "a b c, d e f g h i j k l m, n o p q r";
        let chunks = chunk_text(text, options);

        assert_eq!(texts(&chunks), vec!["a b c, d e f g h i j k l", "m, n o p q r"]);
        assert_eq!(chunks[0].words, 12);
        assert_word_bounds(&chunks, options, text);
    }

    #[test]
    fn test_long_unpunctuated_run_is_split() {
        let text = (1..=30).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunk_text(&text, ChunkerOptions::default());
        assert_eq!(chunks[0].words, 12);
        assert_eq!(chunks[0].reason, ChunkReason::Limit);
        assert_eq!(chunks[1].words, 12);
        assert_eq!(chunks[2].words, 6);
        assert_eq!(chunks[2].reason, ChunkReason::Flush);
    }

    #[test]
    fn test_special_sentinel_closes_chunk() {
        let input = format!("The answer is{SPECIAL_SENTINEL} 42.{FLUSH_SENTINEL}");
        let chunks = chunk_text(&input, ChunkerOptions::default());
        assert_eq!(texts(&chunks), vec!["The answer is", "42."]);
        assert_eq!(chunks[0].reason, ChunkReason::Special);
        assert_eq!(chunks[1].reason, ChunkReason::Hard);
    }

    #[test]
    fn test_bare_special_yields_empty_chunk() {
        let input = format!("{SPECIAL_SENTINEL}Hi.");
        let chunks = chunk_text(&input, ChunkerOptions::default());
        assert_eq!(chunks[0].text, "");
        assert_eq!(chunks[0].reason, ChunkReason::Special);
        assert_eq!(chunks[1].text, "Hi.");
    }

    #[test]
    fn test_flush_sentinel_forces_boundary() {
        let options = ChunkerOptions {
            boost: 0,
            ..ChunkerOptions::default()
        };
        let mut chunker = SemanticChunker::new(options);
        assert!(chunker.push("no punctuation here").is_empty());
        let out = chunker.push(&FLUSH_SENTINEL.to_string());
        assert_eq!(texts(&out), vec!["no punctuation here"]);
        assert_eq!(out[0].reason, ChunkReason::Flush);
        assert!(chunker.finish().is_empty());
    }

    #[test]
    fn test_grapheme_clusters_survive_fragmenting() {
        // Family emoji built from ZWJ sequences, split mid-cluster.
        let family = "👨\u{200D}👩\u{200D}👧";
        let (a, b) = family.split_at(family.find('\u{200D}').unwrap() + 3);
        let collected: Vec<Chunk> = chunks(["Hi ", a, b, "!"], ChunkerOptions::default()).collect();
        let expected = format!("Hi {family}!");
        assert_eq!(texts(&collected), vec![expected.as_str()]);
    }

    #[test]
    fn test_cjk_punctuation() {
        let chunks = chunk_text("你好。今天怎么样？", ChunkerOptions::default());
        assert_eq!(texts(&chunks), vec!["你好。", "今天怎么样？"]);
    }

    #[test]
    fn test_emitter_pairs_specials_in_order() {
        let mut emitter = ChunkEmitter::new();
        emitter.push_special("<|EMOTE_HAPPY|>");
        emitter.push_special("<|DELAY:1|>");

        let special = |text: &str| Chunk {
            text: text.into(),
            words: 0,
            reason: ChunkReason::Special,
        };

        let plain = emitter.emit(Chunk {
            text: format!("hello{FLUSH_SENTINEL}"),
            words: 1,
            reason: ChunkReason::Hard,
        });
        assert_eq!(plain.chunk, "hello");
        assert_eq!(plain.special, None);

        let first = emitter.emit(special("a"));
        assert_eq!(first.special.as_deref(), Some("<|EMOTE_HAPPY|>"));
        let second = emitter.emit(special(""));
        assert_eq!(second.special.as_deref(), Some("<|DELAY:1|>"));
        let third = emitter.emit(special(""));
        assert_eq!(third.special, None);
        assert_eq!(emitter.pending_specials(), 0);
    }
}
