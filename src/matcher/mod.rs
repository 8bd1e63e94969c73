// src/matcher/mod.rs - Token trie plus combined regex alternation for phrase lookups

use log::debug;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::text::{normalize, Transform};

/// Trie over whitespace-separated tokens
#[derive(Debug, Clone)]
pub struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    value: Option<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            value: None,
        }
    }
}

impl<T> TrieNode<T> {
    /// Insert a token path; a later insert of the same path replaces the value
    pub fn insert<S: AsRef<str>>(&mut self, tokens: &[S], value: T) {
        let node = tokens.iter().fold(self, |node, token| {
            node.children.entry(token.as_ref().to_string()).or_default()
        });
        node.value = Some(value);
    }

    /// Longest terminal path starting at `start`, as (token count, value)
    pub fn longest_from<S: AsRef<str>>(&self, tokens: &[S], start: usize) -> Option<(usize, &T)> {
        self.longest_from_where(tokens, start, |_| true)
    }

    /// Same as [`longest_from`](Self::longest_from), skipping terminals rejected by `accept`
    pub fn longest_from_where<S, F>(
        &self,
        tokens: &[S],
        start: usize,
        accept: F,
    ) -> Option<(usize, &T)>
    where
        S: AsRef<str>,
        F: Fn(&T) -> bool,
    {
        let mut node = self;
        let mut best = None;
        for (offset, token) in tokens.iter().skip(start).enumerate() {
            match node.children.get(token.as_ref()) {
                Some(child) => node = child,
                None => break,
            }
            if let Some(value) = node.value.as_ref().filter(|v| accept(v)) {
                best = Some((offset + 1, value));
            }
        }
        best
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.value.is_none()
    }
}

/// Case-insensitive union of regex rules; the per-pattern list is kept in
/// insertion order so the first matching rule is reproducible
#[derive(Debug)]
pub struct CompiledAlternation<T> {
    combined: Regex,
    patterns: Vec<(Regex, T)>,
}

impl<T> CompiledAlternation<T> {
    /// Compile every pattern and their union. `None` when there is nothing to compile.
    pub fn build(patterns: Vec<(String, T)>) -> Result<Option<Self>, regex::Error> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut union = Vec::with_capacity(patterns.len());
        for (pattern, value) in patterns {
            let regex = RegexBuilder::new(&pattern).case_insensitive(true).build()?;
            union.push(format!("(?:{})", pattern));
            compiled.push((regex, value));
        }
        let combined = RegexBuilder::new(&union.join("|"))
            .case_insensitive(true)
            .build()?;
        Ok(Some(Self {
            combined,
            patterns: compiled,
        }))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Index and value of the first pattern that matches `text`
    pub fn find(&self, text: &str) -> Option<(usize, &T)> {
        self.find_where(text, |_| true)
    }

    pub fn find_where<F: Fn(&T) -> bool>(&self, text: &str, accept: F) -> Option<(usize, &T)> {
        if !self.combined.is_match(text) {
            return None;
        }
        self.patterns
            .iter()
            .enumerate()
            .find(|(_, (regex, value))| accept(value) && regex.is_match(text))
            .map(|(index, (_, value))| (index, value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// Literal phrase covering `len` tokens from `start`
    Phrase { start: usize, len: usize },
    /// Regex rule at this index of the alternation
    Pattern(usize),
}

#[derive(Debug)]
pub struct PhraseMatch<'a, T> {
    pub value: &'a T,
    pub source: MatchSource,
}

/// Immutable phrase matcher; rebuilt wholesale and swapped through [`SharedMatcher`]
#[derive(Debug)]
pub struct PhraseMatcher<T> {
    root: TrieNode<T>,
    alternation: Option<CompiledAlternation<T>>,
    phrases: usize,
}

impl<T> Default for PhraseMatcher<T> {
    fn default() -> Self {
        Self {
            root: TrieNode::default(),
            alternation: None,
            phrases: 0,
        }
    }
}

impl<T> PhraseMatcher<T> {
    /// Build from phrase -> value; phrases are tokenized on whitespace as-is
    pub fn build<I>(phrases: I) -> Self
    where
        I: IntoIterator<Item = (String, T)>,
    {
        Self::build_with(phrases, &[])
    }

    /// Build with phrases normalized through the same transforms the
    /// message tokens will go through
    pub fn build_with<I>(phrases: I, transforms: &[Transform]) -> Self
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let mut root = TrieNode::default();
        let mut count = 0;
        for (phrase, value) in phrases {
            let phrase = normalize(&phrase, transforms);
            let tokens: Vec<&str> = phrase.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            root.insert(&tokens, value);
            count += 1;
        }
        debug!("Built phrase trie with {} phrases", count);
        Self {
            root,
            alternation: None,
            phrases: count,
        }
    }

    pub fn with_alternation(mut self, alternation: Option<CompiledAlternation<T>>) -> Self {
        self.alternation = alternation;
        self
    }

    pub fn phrase_count(&self) -> usize {
        self.phrases
    }

    pub fn pattern_count(&self) -> usize {
        self.alternation.as_ref().map_or(0, |a| a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.phrases == 0 && self.pattern_count() == 0
    }

    /// Longest literal phrase (ties go to the lowest start index); the regex
    /// alternation is consulted only when no literal phrase matched
    pub fn find<S: AsRef<str>>(&self, text: &str, tokens: &[S]) -> Option<PhraseMatch<'_, T>> {
        self.find_where(text, tokens, |_| true)
    }

    /// [`find`](Self::find) restricted to values accepted by `accept`
    pub fn find_where<S, F>(
        &self,
        text: &str,
        tokens: &[S],
        accept: F,
    ) -> Option<PhraseMatch<'_, T>>
    where
        S: AsRef<str>,
        F: Fn(&T) -> bool,
    {
        let mut best: Option<(usize, usize, &T)> = None;
        if !self.root.is_empty() {
            for start in 0..tokens.len() {
                if let Some((len, value)) = self.root.longest_from_where(tokens, start, &accept) {
                    if best.map_or(true, |(_, best_len, _)| len > best_len) {
                        best = Some((start, len, value));
                    }
                }
            }
        }
        if let Some((start, len, value)) = best {
            return Some(PhraseMatch {
                value,
                source: MatchSource::Phrase { start, len },
            });
        }
        self.alternation
            .as_ref()
            .and_then(|alt| alt.find_where(text, &accept))
            .map(|(index, value)| PhraseMatch {
                value,
                source: MatchSource::Pattern(index),
            })
    }

    pub fn is_match<S: AsRef<str>>(&self, text: &str, tokens: &[S]) -> bool {
        self.find(text, tokens).is_some()
    }
}

/// Pointer-swapped handle: readers clone the current `Arc` and never block a rebuild
#[derive(Debug)]
pub struct Swappable<T> {
    current: RwLock<Arc<T>>,
}

impl<T: Default> Default for Swappable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Swappable<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn swap(&self, value: T) -> Arc<T> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(value))
    }
}

pub type SharedMatcher<T> = Swappable<PhraseMatcher<T>>;
