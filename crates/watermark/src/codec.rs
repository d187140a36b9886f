//! Invisible watermark codec.
//!
//! A watermark is a short run of zero-width marker characters. The click
//! side embeds it into the outgoing message; the correlation side pulls it
//! back out of whatever the contact actually sent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker alphabet. Only these characters ever form a watermark.
pub const ALPHABET: [char; 4] = [
    '\u{200B}', // zero width space
    '\u{200C}', // zero width non-joiner
    '\u{200D}', // zero width joiner
    '\u{2063}', // invisible separator
];

const ZERO_WIDTH_JOINER: char = '\u{200D}';

/// Terminators the channel (or the contact) tends to append or trim.
const TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Returns true when `c` belongs to the marker alphabet.
pub fn is_marker(c: char) -> bool {
    ALPHABET.contains(&c)
}

/// Which characters of `chars` are watermark markers. A joiner between two
/// visible characters glues an emoji sequence together and is not one.
fn marker_flags(chars: &[char]) -> Vec<bool> {
    (0..chars.len())
        .map(|i| {
            let c = chars[i];
            if !is_marker(c) {
                return false;
            }
            if c != ZERO_WIDTH_JOINER || i == 0 {
                return true;
            }
            match chars.get(i + 1) {
                Some(next) => is_marker(chars[i - 1]) || is_marker(*next),
                None => true,
            }
        })
        .collect()
}

/// Characters that attach to the one before them: variation selectors,
/// skin tone modifiers and the keycap mark.
fn is_modifier(c: char) -> bool {
    matches!(c as u32, 0xFE00..=0xFE0F | 0x1F3FB..=0x1F3FF | 0x20E3)
}

/// A sequence of marker characters. May be empty (no watermark found).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Watermark(String);

impl Watermark {
    /// The empty watermark returned by [`extract`] when nothing is present.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Build from alphabet indices. Out-of-range indices wrap.
    pub fn from_indices(indices: &[usize]) -> Self {
        Self(indices.iter().map(|i| ALPHABET[i % ALPHABET.len()]).collect())
    }

    /// Parse a string consisting only of marker characters.
    pub fn parse(raw: &str) -> Result<Self, InvalidWatermark> {
        match raw.chars().find(|c| !is_marker(*c)) {
            Some(c) => Err(InvalidWatermark(c)),
            None => Ok(Self(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of markers.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Printable form (`0`-`3` per marker) used for storage keys and logs.
    pub fn digits(&self) -> String {
        self.0
            .chars()
            .filter_map(|c| ALPHABET.iter().position(|m| *m == c))
            .map(|i| char::from(b'0' + i as u8))
            .collect()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wm[{}]", self.digits())
    }
}

impl TryFrom<String> for Watermark {
    type Error = InvalidWatermark;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Watermark> for String {
    fn from(value: Watermark) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("character {0:?} is not a watermark marker")]
pub struct InvalidWatermark(pub char);

/// Insert `code` right after the first visible character of `text`.
///
/// Markers already present in `text` are dropped first so the composed
/// message carries exactly one watermark. A leading emoji is kept whole:
/// the code goes after its modifiers and joined parts.
pub fn embed(text: &str, code: &Watermark) -> String {
    let chars: Vec<char> = text.chars().collect();
    let flags = marker_flags(&chars);
    let clean: Vec<char> = chars
        .into_iter()
        .zip(flags)
        .filter(|(_, marker)| !marker)
        .map(|(c, _)| c)
        .collect();

    let split = match clean.iter().position(|c| !c.is_whitespace()) {
        Some(first) => {
            let mut end = first + 1;
            loop {
                match clean.get(end) {
                    Some(c) if is_modifier(*c) => end += 1,
                    Some(&ZERO_WIDTH_JOINER) if clean.get(end + 1).is_some() => end += 2,
                    _ => break,
                }
            }
            end
        }
        None => clean.len(),
    };

    let mut out = String::with_capacity(text.len() + code.as_str().len());
    out.extend(&clean[..split]);
    out.push_str(code.as_str());
    out.extend(&clean[split..]);
    out
}

/// Keep only the marker characters of `received`, in order. Joiners inside
/// emoji sequences are not markers and are skipped.
pub fn extract(received: &str) -> Watermark {
    let chars: Vec<char> = received.chars().collect();
    let flags = marker_flags(&chars);
    Watermark(
        chars
            .into_iter()
            .zip(flags)
            .filter(|(_, marker)| *marker)
            .map(|(c, _)| c)
            .collect(),
    )
}

/// Visible text with markers and decorative symbols removed, trailing
/// whitespace and a single trailing terminator trimmed.
pub fn strip(text: &str) -> String {
    let visible: String = text
        .chars()
        .filter(|c| !is_marker(*c) && !is_decorative(*c))
        .collect();
    let trimmed = visible.trim_end();
    let trimmed = trimmed
        .strip_suffix(|c: char| TERMINATORS.contains(&c))
        .unwrap_or(trimmed);
    trimmed.trim_end().to_string()
}

fn is_decorative(c: char) -> bool {
    matches!(c as u32,
        0x1F300..=0x1F9FF
        | 0x1FA70..=0x1FAFF
        | 0x2600..=0x26FF
        | 0x2700..=0x27BF
        | 0x1F1E0..=0x1F1FF
        | 0xFE0F)
}
