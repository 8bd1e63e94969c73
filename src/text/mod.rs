// src/text/mod.rs - Message text normalization with per-message memoization

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

pub mod homoglyph;
pub mod layout;

/// A single text transform; application order matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    Lowercase,
    /// Drop everything that is not a letter, digit or whitespace, keeping a
    /// `!` command marker at the very start of the text
    StripPunctuation,
    /// "heeelllo" -> "helo"
    CollapseRepeats,
    /// Zero-width, bidi-control and tag characters
    StripInvisible,
    Homoglyphs,
}

impl Transform {
    /// Pipeline used for similarity and phrase matching
    pub const CANONICAL: &'static [Transform] = &[
        Transform::StripInvisible,
        Transform::Homoglyphs,
        Transform::Lowercase,
        Transform::StripPunctuation,
        Transform::CollapseRepeats,
    ];

    /// Pipeline used for banword lookups; keeps repeated letters
    pub const MATCHING: &'static [Transform] = &[
        Transform::StripInvisible,
        Transform::Homoglyphs,
        Transform::Lowercase,
        Transform::StripPunctuation,
    ];

    fn id(self) -> u64 {
        match self {
            Transform::Lowercase => 1,
            Transform::StripPunctuation => 2,
            Transform::CollapseRepeats => 3,
            Transform::StripInvisible => 4,
            Transform::Homoglyphs => 5,
        }
    }

    pub fn apply(self, text: &str) -> String {
        match self {
            Transform::Lowercase => text.to_lowercase(),
            Transform::StripPunctuation => strip_punctuation(text),
            Transform::CollapseRepeats => collapse_repeats(text),
            Transform::StripInvisible => text.chars().filter(|c| !is_invisible(*c)).collect(),
            Transform::Homoglyphs => homoglyph::fold(text),
        }
    }
}

/// Memo key for an ordered transform list (rolling hash over transform ids)
fn transform_key(transforms: &[Transform]) -> u64 {
    transforms
        .iter()
        .fold(17u64, |acc, t| acc.wrapping_mul(31).wrapping_add(t.id()))
}

/// Apply transforms in order without memoization
pub fn normalize(text: &str, transforms: &[Transform]) -> String {
    transforms
        .iter()
        .fold(text.to_string(), |acc, t| t.apply(&acc))
}

fn strip_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() || c.is_whitespace() || (i == 0 && c == '!') {
            out.push(c);
        }
    }
    out
}

fn collapse_repeats(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if c.is_alphabetic() && prev == Some(c) {
            continue;
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

pub fn is_invisible(c: char) -> bool {
    matches!(
        c as u32,
        0x00AD
            | 0x034F
            | 0x061C
            | 0x115F
            | 0x1160
            | 0x17B4
            | 0x17B5
            | 0x180E
            | 0x200B..=0x200F
            | 0x202A..=0x202E
            | 0x2060..=0x2064
            | 0x2066..=0x206F
            | 0x3164
            | 0xFE00..=0xFE0F
            | 0xFEFF
            | 0xFFA0
            | 0xE0000..=0xE007F
    )
}

/// Message text plus memoized normalized forms, keyed by transform order
#[derive(Debug, Default)]
pub struct NormalizedText {
    original: String,
    strings: Mutex<HashMap<u64, Arc<str>>>,
    tokens: Mutex<HashMap<u64, Arc<[String]>>>,
}

impl Clone for NormalizedText {
    fn clone(&self) -> Self {
        Self::new(self.original.clone())
    }
}

impl NormalizedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            original: text.into(),
            strings: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Build from raw bytes; invalid sequences become U+FFFD
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// Replace the underlying text and drop every cached form
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.original = text.into();
        self.strings.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
        self.tokens.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Placeholder / alias substitution
    pub fn replace_all(&mut self, from: &str, to: &str) {
        if from.is_empty() || !self.original.contains(from) {
            return;
        }
        let replaced = self.original.replace(from, to);
        self.set_text(replaced);
    }

    pub fn normalize(&self, transforms: &[Transform]) -> Arc<str> {
        let key = transform_key(transforms);
        let mut cache = self.strings.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(key)
            .or_insert_with(|| Arc::from(normalize(&self.original, transforms)))
            .clone()
    }

    pub fn tokenize(&self, transforms: &[Transform]) -> Arc<[String]> {
        let key = transform_key(transforms);
        if let Some(hit) = self
            .tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return hit.clone();
        }
        let text = self.normalize(transforms);
        let tokens: Arc<[String]> = text.split_whitespace().map(str::to_string).collect();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert(tokens)
            .clone()
    }

    pub fn words(&self, transforms: &[Transform]) -> WordSet {
        WordSet::from_tokens(self.tokenize(transforms).iter())
    }
}

/// Order-independent set of word hashes used for similarity comparison
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordSet {
    hashes: Vec<u64>,
}

impl WordSet {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hashes: Vec<u64> = tokens
            .into_iter()
            .map(|t| {
                let mut hasher = DefaultHasher::new();
                t.as_ref().hash(&mut hasher);
                hasher.finish()
            })
            .collect();
        hashes.sort_unstable();
        hashes.dedup();
        Self { hashes }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// `|A ∩ B| / |A ∪ B|`; 0.0 when both sets are empty
    pub fn jaccard(&self, other: &WordSet) -> f64 {
        let (a, b) = (&self.hashes, &other.hashes);
        let (mut i, mut j, mut common) = (0, 0, 0usize);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    common += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        let union = a.len() + b.len() - common;
        if union == 0 {
            0.0
        } else {
            common as f64 / union as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "",
        "Hello, World!!!",
        "!command with ARGS...",
        "heeeelllooo   chat",
        "fr\u{200B}ee b\u{202E}ux",
        "bаdwоrd and ТЕКСТ",
        "пидоррр!!",
        "ＦＲＥＥ\u{E0000} coins",
        "a.a.a b..b",
        "аааааа bcd",
        "a.a.a бвг",
        "ААааа ccс",
    ];

    #[test]
    fn test_strip_punctuation_keeps_command_marker() {
        assert_eq!(Transform::StripPunctuation.apply("!so @user, now!"), "!so user now");
        assert_eq!(Transform::StripPunctuation.apply(" !so"), " so");
        assert_eq!(Transform::StripPunctuation.apply("..!so"), "so");
    }

    #[test]
    fn test_order_matters() {
        let a = normalize("a.a", &[Transform::StripPunctuation, Transform::CollapseRepeats]);
        let b = normalize("a.a", &[Transform::CollapseRepeats, Transform::StripPunctuation]);
        assert_eq!(a, "a");
        assert_eq!(b, "aa");
        assert_ne!(
            transform_key(&[Transform::StripPunctuation, Transform::CollapseRepeats]),
            transform_key(&[Transform::CollapseRepeats, Transform::StripPunctuation])
        );
    }

    #[test]
    fn test_normalization_idempotent() {
        let pipelines: &[&[Transform]] = &[
            Transform::CANONICAL,
            Transform::MATCHING,
            &[Transform::Lowercase],
            &[Transform::StripInvisible, Transform::StripPunctuation],
            &[Transform::Homoglyphs, Transform::CollapseRepeats],
        ];
        for text in SAMPLES {
            for pipeline in pipelines {
                let once = normalize(text, pipeline);
                assert_eq!(normalize(&once, pipeline), once, "{:?} via {:?}", text, pipeline);
            }
        }
    }

    #[test]
    fn test_repeated_letters_do_not_flip_script() {
        let once = normalize("аааааа bcd", Transform::CANONICAL);
        assert_eq!(once, "a bcd");
        assert_eq!(normalize(&once, Transform::CANONICAL), once);
    }

    #[test]
    fn test_invisible_stripped() {
        let text = NormalizedText::new("fr\u{200B}ee\u{E0000}");
        assert_eq!(&*text.normalize(&[Transform::StripInvisible]), "free");
    }

    #[test]
    fn test_memoized_and_invalidated() {
        let mut text = NormalizedText::new("Hello HELLO");
        let first = text.normalize(Transform::CANONICAL);
        let second = text.normalize(Transform::CANONICAL);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&*text.tokenize(Transform::CANONICAL), &["helo", "helo"]);

        text.replace_all("HELLO", "bye");
        assert_eq!(&*text.normalize(Transform::CANONICAL), "helo bye");
        assert_eq!(text.tokenize(Transform::CANONICAL).len(), 2);
    }

    #[test]
    fn test_invalid_utf8_does_not_panic() {
        let text = NormalizedText::from_bytes(b"buy \xff\xfe cheap");
        assert_eq!(&*text.normalize(Transform::CANONICAL), "buy  cheap");
        assert_eq!(text.words(Transform::CANONICAL).len(), 2);
    }

    #[test]
    fn test_word_set_order_independent() {
        let a = WordSet::from_tokens(["free", "coins", "now", "free"]);
        let b = WordSet::from_tokens(["now", "coins", "free"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_jaccard_bounds() {
        let sets = [
            WordSet::from_tokens(["a", "b", "c"]),
            WordSet::from_tokens(["b", "c", "d"]),
            WordSet::from_tokens(["x"]),
            WordSet::default(),
        ];
        for a in &sets {
            for b in &sets {
                let s = a.jaccard(b);
                assert!((0.0..=1.0).contains(&s));
                assert_eq!(s, b.jaccard(a));
            }
            if !a.is_empty() {
                assert_eq!(a.jaccard(a), 1.0);
            }
        }
        assert_eq!(sets[0].jaccard(&sets[1]), 0.5);
        assert_eq!(sets[3].jaccard(&sets[3]), 0.0);
    }
}
