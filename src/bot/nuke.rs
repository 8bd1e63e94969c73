// src/bot/nuke.rs - Temporary mass-moderation rule and its history sweep

use chrono::{DateTime, Utc};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::bot::similarity::History;
use crate::config::{ConfigError, NukeDefaults};
use crate::matcher::{CompiledAlternation, PhraseMatcher};
use crate::text::{NormalizedText, Transform};
use crate::types::{Action, Punishment};

/// Requested nuke: any listed word/phrase or regex hit is punished on sight
#[derive(Debug, Clone, PartialEq)]
pub struct NukeRule {
    pub phrases: Vec<String>,
    pub regex: Vec<String>,
    pub punishment: Punishment,
    /// Lifetime of the rule for live messages
    pub duration: Duration,
    /// How far back the history sweep reaches
    pub scrollback: Duration,
}

impl NukeRule {
    pub fn new(defaults: &NukeDefaults) -> Self {
        Self {
            phrases: Vec::new(),
            regex: Vec::new(),
            punishment: defaults.punishment,
            duration: Duration::from_secs(defaults.duration_secs),
            scrollback: Duration::from_secs(defaults.scrollback_secs),
        }
    }

    pub fn phrase(mut self, phrase: impl Into<String>) -> Self {
        self.phrases.push(phrase.into());
        self
    }

    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex.push(pattern.into());
        self
    }

    pub fn punishment(mut self, punishment: Punishment) -> Self {
        self.punishment = punishment;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Compiled, installed nuke
#[derive(Debug)]
pub struct ActiveNuke {
    pub generation: u64,
    pub punishment: Punishment,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    scrollback: Duration,
    matcher: PhraseMatcher<()>,
}

impl ActiveNuke {
    pub fn compile(rule: &NukeRule, generation: u64) -> Result<Self, ConfigError> {
        let alternation = CompiledAlternation::build(
            rule.regex.iter().map(|p| (p.clone(), ())).collect(),
        )
        .map_err(|source| ConfigError::InvalidRegex {
            section: "nuke".to_string(),
            pattern: rule.regex.join(" | "),
            source,
        })?;
        let matcher = PhraseMatcher::build_with(
            rule.phrases.iter().map(|p| (p.clone(), ())),
            Transform::MATCHING,
        )
        .with_alternation(alternation);
        if matcher.is_empty() {
            return Err(ConfigError::EmptyPattern("nuke".to_string()));
        }
        let started_at = Utc::now();
        let lifetime = chrono::Duration::from_std(rule.duration).unwrap_or(chrono::Duration::MAX);
        Ok(Self {
            generation,
            punishment: rule.punishment,
            started_at,
            expires_at: started_at.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC),
            scrollback: rule.scrollback,
            matcher,
        })
    }

    pub fn matches(&self, text: &NormalizedText) -> bool {
        self.matcher.is_match(
            &text.normalize(&[Transform::StripInvisible]),
            &text.tokenize(Transform::MATCHING),
        )
    }

    pub fn action(&self) -> Action {
        Action::from_punishment(self.punishment, "nuke")
    }

    /// Users whose recent window messages match, one action each
    pub fn sweep(&self, history: &History) -> Vec<(String, Action)> {
        let reach = chrono::Duration::from_std(self.scrollback).unwrap_or(chrono::Duration::MAX);
        let since = self
            .started_at
            .checked_sub_signed(reach)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut hits: Vec<(String, Action)> = history
            .users()
            .into_iter()
            .filter(|user| {
                history
                    .newest_first(user)
                    .iter()
                    .take_while(|entry| entry.at >= since)
                    .any(|entry| self.matches(&NormalizedText::new(entry.body.as_str())))
            })
            .map(|user| (user, self.action()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        hits
    }
}

/// The single nuke slot. Each install gets a new generation so a stale
/// expiry timer cannot clear a newer rule.
#[derive(Debug, Default)]
pub struct NukeSlot {
    active: RwLock<Option<Arc<ActiveNuke>>>,
    generation: AtomicU64,
}

impl NukeSlot {
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn install(&self, nuke: ActiveNuke) -> Arc<ActiveNuke> {
        let nuke = Arc::new(nuke);
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(nuke.clone());
        info!(
            "Nuke #{} active until {} ({})",
            nuke.generation, nuke.expires_at, nuke.punishment
        );
        nuke
    }

    pub fn current(&self) -> Option<Arc<ActiveNuke>> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Clear the slot if it still holds `generation`
    pub fn expire(&self, generation: u64) -> bool {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some(nuke) if nuke.generation == generation => {
                *active = None;
                info!("Nuke #{} expired", generation);
                true
            }
            _ => false,
        }
    }

    /// Clear whatever is installed; a no-op when nothing is
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(nuke) = &cancelled {
            info!("Nuke #{} cancelled", nuke.generation);
        }
        cancelled.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::similarity::HistoryEntry;

    fn rule() -> NukeRule {
        NukeRule::new(&NukeDefaults::default())
            .phrase("free followers")
            .regex(r"bigfollows\s*\.\s*com")
    }

    fn entry(body: &str, age_secs: i64) -> HistoryEntry {
        HistoryEntry {
            words: NormalizedText::new(body).words(Transform::CANONICAL),
            emote_only: false,
            ignore: false,
            body: body.to_string(),
            at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_matches_phrase_or_regex() {
        let nuke = ActiveNuke::compile(&rule(), 1).unwrap();
        assert!(nuke.matches(&NormalizedText::new("get FREE followers!")));
        assert!(nuke.matches(&NormalizedText::new("visit bigfollows . com")));
        assert!(!nuke.matches(&NormalizedText::new("free stuff")));
        assert_eq!(nuke.action().reason, "nuke");
    }

    #[test]
    fn test_empty_rule_rejected() {
        let empty = NukeRule::new(&NukeDefaults::default());
        assert!(ActiveNuke::compile(&empty, 1).is_err());
        assert!(ActiveNuke::compile(&empty.regex("("), 1).is_err());
    }

    #[test]
    fn test_sweep_respects_scrollback() {
        let history = History::new(10, Duration::from_secs(600));
        history.push("alice", "1", entry("free followers here", 5));
        history.push("bob", "2", entry("FREE followers", 300));
        history.push("carol", "3", entry("hello", 1));
        let nuke = ActiveNuke::compile(&rule(), 1).unwrap();
        let hits = nuke.sweep(&history);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "alice");
    }

    #[test]
    fn test_slot_generation_and_idempotent_cancel() {
        let slot = NukeSlot::default();
        let first = slot.next_generation();
        slot.install(ActiveNuke::compile(&rule(), first).unwrap());
        let second = slot.next_generation();
        slot.install(ActiveNuke::compile(&rule(), second).unwrap());

        // stale timer from the first nuke
        assert!(!slot.expire(first));
        assert!(slot.current().is_some());

        assert!(slot.cancel());
        assert!(!slot.cancel());
        assert!(!slot.expire(second));
        assert!(slot.current().is_none());
    }
}
