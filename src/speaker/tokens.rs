//! Control markers embedded in streamed LLM text.
//!
//! Markers look like `<|EMOTE_HAPPY|>`, `<|DELAY:1.5|>` or
//! `<|MOTION_WAVE|>`. They are removed from the visible text and returned
//! as [`ControlToken`]s. [`StreamTokenizer`] does the same over text that
//! arrives in arbitrary fragments, never emitting half a marker.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Zero-width marker that forces the chunker to close the current chunk.
pub const FLUSH_SENTINEL: char = '\u{200B}';

/// Zero-width marker standing in for a control token in the chunker input.
pub const SPECIAL_SENTINEL: char = '\u{2063}';

const OPEN: &str = "<|";
const CLOSE: &str = "|>";

/// Default cap on the stream tokenizer's buffer, in bytes.
pub const DEFAULT_MAX_BUFFER: usize = 4096;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<\|(?:EMOTE_([A-Z0-9_]+)|DELAY:(\d+(?:\.\d+)?)|MOTION_([A-Z0-9_]+))\|>")
        .expect("marker pattern is valid")
});

/// Baseline emotion vocabulary understood by the speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Think,
    Surprised,
    Awkward,
    Question,
    Curious,
    Neutral,
}

impl Emotion {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "HAPPY" => Some(Self::Happy),
            "SAD" => Some(Self::Sad),
            "ANGRY" => Some(Self::Angry),
            "THINK" => Some(Self::Think),
            "SURPRISED" => Some(Self::Surprised),
            "AWKWARD" => Some(Self::Awkward),
            "QUESTION" => Some(Self::Question),
            "CURIOUS" => Some(Self::Curious),
            "NEUTRAL" => Some(Self::Neutral),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Happy => "HAPPY",
            Self::Sad => "SAD",
            Self::Angry => "ANGRY",
            Self::Think => "THINK",
            Self::Surprised => "SURPRISED",
            Self::Awkward => "AWKWARD",
            Self::Question => "QUESTION",
            Self::Curious => "CURIOUS",
            Self::Neutral => "NEUTRAL",
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// `known` is true only for names in the [`Emotion`] vocabulary.
    Emote { name: String, known: bool },
    Delay { seconds: f64 },
    Motion { name: String },
}

/// A marker found in a single parse call.
///
/// `start`/`end` are byte offsets into the string that was parsed and mean
/// nothing outside that call.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlToken {
    pub raw: String,
    pub start: usize,
    pub end: usize,
    pub kind: TokenKind,
}

impl ControlToken {
    fn from_captures(caps: &Captures<'_>) -> Self {
        let whole = caps.get(0).expect("group 0 always participates");
        let kind = if let Some(name) = caps.get(1) {
            let name = name.as_str().to_string();
            let known = Emotion::from_name(&name).is_some();
            TokenKind::Emote { name, known }
        } else if let Some(seconds) = caps.get(2) {
            // The pattern only admits plain decimals, which always parse.
            let seconds = seconds.as_str().parse().unwrap_or(0.0);
            TokenKind::Delay { seconds }
        } else {
            let name = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            TokenKind::Motion {
                name: name.to_string(),
            }
        };

        Self {
            raw: whole.as_str().to_string(),
            start: whole.start(),
            end: whole.end(),
            kind,
        }
    }

    /// Known emotion carried by an emote marker.
    pub fn emotion(&self) -> Option<Emotion> {
        match &self.kind {
            TokenKind::Emote { name, .. } => Emotion::from_name(name),
            _ => None,
        }
    }
}

/// Visible text plus the markers removed from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenizedText {
    pub text: String,
    pub tokens: Vec<ControlToken>,
}

impl TokenizedText {
    fn from_pieces(pieces: Vec<Piece>) -> Self {
        let mut out = Self::default();
        for piece in pieces {
            match piece {
                Piece::Text(text) => out.text.push_str(&text),
                Piece::Token(token) => out.tokens.push(token),
            }
        }
        out
    }
}

/// Text and markers in source order.
#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    Text(String),
    Token(ControlToken),
}

/// Split `input` into text runs and markers, preserving order.
pub fn parse_pieces(input: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for caps in MARKER.captures_iter(input) {
        let token = ControlToken::from_captures(&caps);
        if token.start > last {
            pieces.push(Piece::Text(input[last..token.start].to_string()));
        }
        last = token.end;
        pieces.push(Piece::Token(token));
    }
    if last < input.len() {
        pieces.push(Piece::Text(input[last..].to_string()));
    }
    pieces
}

/// Remove every marker from `input` and return them in match order.
pub fn parse_tokens(input: &str) -> TokenizedText {
    TokenizedText::from_pieces(parse_pieces(input))
}

/// Remove every marker from `input` without collecting them.
pub fn strip_tokens(input: &str) -> String {
    MARKER.replace_all(input, "").into_owned()
}

/// Find the first marker starting at or after byte offset `from`.
pub fn next_token(input: &str, from: usize) -> Option<ControlToken> {
    if from > input.len() {
        return None;
    }
    MARKER
        .captures_at(input, from)
        .map(|caps| ControlToken::from_captures(&caps))
}

/// Remove the flush/special sentinels.
pub fn strip_sentinels(input: &str) -> String {
    input
        .chars()
        .filter(|&c| c != FLUSH_SENTINEL && c != SPECIAL_SENTINEL)
        .collect()
}

/// Byte offset from which `s` might still be the start of a marker: the
/// first opener, or a lone trailing `<`. Everything before it is safe.
fn unsafe_tail_start(s: &str) -> usize {
    match s.find(OPEN) {
        Some(idx) => idx,
        None if s.ends_with('<') => s.len() - 1,
        None => s.len(),
    }
}

/// Incremental marker parser for streamed text.
///
/// Holds back any tail of the input that could still turn into a marker,
/// so emitted text never contains a partial `<|...`.
#[derive(Debug)]
pub struct StreamTokenizer {
    buffer: String,
    max_buffer: usize,
}

impl Default for StreamTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

impl StreamTokenizer {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffer,
        }
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn ingest(&mut self, chunk: &str) -> TokenizedText {
        TokenizedText::from_pieces(self.ingest_pieces(chunk))
    }

    pub fn flush(&mut self) -> TokenizedText {
        TokenizedText::from_pieces(self.flush_pieces())
    }

    /// Like [`ingest`](Self::ingest) but keeps text and markers interleaved.
    pub fn ingest_pieces(&mut self, chunk: &str) -> Vec<Piece> {
        self.buffer.push_str(chunk);

        if self.buffer.len() > self.max_buffer {
            tracing::debug!(
                "Tokenizer buffer over {} bytes, force-flushing",
                self.max_buffer
            );
            return self.flush_pieces();
        }

        let mut pieces = Vec::new();

        // Everything up to the last closer is a complete segment.
        if let Some(close) = self.buffer.rfind(CLOSE) {
            let split = close + CLOSE.len();
            let rest = self.buffer.split_off(split);
            let complete = std::mem::replace(&mut self.buffer, rest);
            pieces.extend(parse_pieces(&complete));
        }

        // No closer in what remains: emit up to the first possible opener.
        let safe = unsafe_tail_start(&self.buffer);
        if safe > 0 {
            let held = self.buffer.split_off(safe);
            let text = std::mem::replace(&mut self.buffer, held);
            pieces.push(Piece::Text(text));
        }

        merge_text(pieces)
    }

    /// Parse and clear whatever is buffered. A dangling partial marker
    /// comes out as literal text.
    pub fn flush_pieces(&mut self) -> Vec<Piece> {
        let buffer = std::mem::take(&mut self.buffer);
        parse_pieces(&buffer)
    }
}

/// Join adjacent text pieces so callers see one run per gap.
fn merge_text(pieces: Vec<Piece>) -> Vec<Piece> {
    let mut merged: Vec<Piece> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match (merged.last_mut(), piece) {
            (Some(Piece::Text(prev)), Piece::Text(text)) => prev.push_str(&text),
            (_, piece) => merged.push(piece),
        }
    }
    merged
}
