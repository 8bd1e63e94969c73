// src/bot/similarity.rs - Per-user message history window and near-duplicate tally

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::store::{KeyWindow, StoreOptions, TimerKey, TimingWheel, TtlStore};
use crate::text::WordSet;

/// What the window remembers about one accepted message
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub words: WordSet,
    pub emote_only: bool,
    /// Kept for nuke scrollback but never counted as spam
    pub ignore: bool,
    /// Message body after reply-prefix stripping
    pub body: String,
    pub at: DateTime<Utc>,
}

/// Similarity knobs of one tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TallyParams {
    pub threshold: f64,
    pub min_gap: usize,
}

/// Messages in the current run of near-duplicates, the current one included.
///
/// `history` is scanned newest first. A prior message with similarity at or
/// above the threshold counts when fewer than `min_gap` dissimilar messages
/// were seen since the last similar one; any similar message closes the gap
/// and every dissimilar one widens it, so `min_gap = 0` counts nothing.
/// Entries of the other class (emote-only vs text) and ignored entries are
/// skipped without touching the gap.
pub fn tally<'a, I>(current: &WordSet, emote_only: bool, history: I, params: TallyParams) -> usize
where
    I: IntoIterator<Item = &'a HistoryEntry>,
{
    let mut count = 1;
    let mut gap = 0;
    for entry in history {
        if entry.ignore || entry.emote_only != emote_only {
            continue;
        }
        if current.jaccard(&entry.words) >= params.threshold {
            if gap < params.min_gap {
                count += 1;
            }
            gap = 0;
        } else {
            gap += 1;
        }
    }
    count
}

/// One user's history, held under the user's lock
pub type HistoryWindow<'a> = KeyWindow<'a, String, String, Arc<HistoryEntry>>;

/// User -> message id -> entry, oldest first, bounded in size and age
#[derive(Clone)]
pub struct History {
    store: TtlStore<String, String, Arc<HistoryEntry>>,
}

impl History {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_options(StoreOptions::default().with_ttl(ttl).with_capacity(capacity))
    }

    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            store: TtlStore::new(options),
        }
    }

    pub fn wheel(&self) -> Arc<TimingWheel<TimerKey<String, String>>> {
        self.store.wheel()
    }

    pub fn push(&self, user: &str, message_id: &str, entry: HistoryEntry) {
        self.store
            .push(user.to_string(), message_id.to_string(), Arc::new(entry));
    }

    /// Scan and append for `user` as one step
    pub fn with_window<R>(&self, user: &str, f: impl FnOnce(&mut HistoryWindow<'_>) -> R) -> R {
        self.store.with_key(user.to_string(), f)
    }

    pub fn newest_first(&self, user: &str) -> Vec<Arc<HistoryEntry>> {
        let mut entries: Vec<Arc<HistoryEntry>> = self
            .store
            .snapshot(&user.to_string())
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();
        entries.reverse();
        entries
    }

    pub fn len(&self, user: &str) -> usize {
        self.store.len(&user.to_string())
    }

    pub fn clear(&self, user: &str) -> usize {
        self.store.clear_key(&user.to_string())
    }

    pub fn users(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.store.set_capacity(capacity);
    }

    pub fn ttl(&self) -> Duration {
        self.store.ttl()
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.store.set_ttl(ttl);
    }

    pub fn max_users(&self) -> usize {
        self.store.max_keys()
    }

    pub fn set_max_users(&self, max_users: usize) {
        self.store.set_max_keys(max_users);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::{NormalizedText, Transform};

    fn entry(text: &str) -> HistoryEntry {
        HistoryEntry {
            words: NormalizedText::new(text).words(Transform::CANONICAL),
            emote_only: false,
            ignore: false,
            body: text.to_string(),
            at: Utc::now(),
        }
    }

    fn words(text: &str) -> WordSet {
        NormalizedText::new(text).words(Transform::CANONICAL)
    }

    const PARAMS: TallyParams = TallyParams {
        threshold: 0.7,
        min_gap: 1,
    };

    #[test]
    fn test_tally_counts_consecutive_duplicates() {
        let history = vec![entry("buy cheap coins now"), entry("BUY cheap coins now!!")];
        assert_eq!(tally(&words("buy cheap coins now"), false, &history, PARAMS), 3);
        assert_eq!(tally(&words("hello chat"), false, &history, PARAMS), 1);
    }

    #[test]
    fn test_gap_tolerance() {
        // newest first
        let history = vec![
            entry("what a game"),
            entry("buy cheap coins now"),
            entry("nice play"),
            entry("lol"),
            entry("buy cheap coins now"),
        ];
        let current = words("buy cheap coins now");
        // with min_gap 1 a dissimilar message in between breaks the run
        assert_eq!(tally(&current, false, &history, PARAMS), 1);
        let one_between = TallyParams {
            min_gap: 2,
            ..PARAMS
        };
        assert_eq!(tally(&current, false, &history, one_between), 2);
        let two_between = TallyParams {
            min_gap: 3,
            ..PARAMS
        };
        assert_eq!(tally(&current, false, &history, two_between), 3);
    }

    #[test]
    fn test_single_dissimilar_message_breaks_default_run() {
        let history = vec![entry("what a game"), entry("buy cheap coins now")];
        assert_eq!(tally(&words("buy cheap coins now"), false, &history, PARAMS), 1);
    }

    #[test]
    fn test_zero_min_gap_counts_nothing() {
        let history = vec![entry("buy cheap coins now"), entry("buy cheap coins now")];
        let none = TallyParams {
            min_gap: 0,
            ..PARAMS
        };
        assert_eq!(tally(&words("buy cheap coins now"), false, &history, none), 1);
    }

    #[test]
    fn test_emote_and_ignored_entries_skipped() {
        let mut emote = entry("buy cheap coins now");
        emote.emote_only = true;
        let mut ignored = entry("buy cheap coins now");
        ignored.ignore = true;
        let history = vec![emote, ignored, entry("buy cheap coins now")];
        assert_eq!(tally(&words("buy cheap coins now"), false, &history, PARAMS), 2);
        assert_eq!(tally(&words("buy cheap coins now"), true, &history, PARAMS), 2);
    }

    #[test]
    fn test_empty_messages_never_similar() {
        let history = vec![entry(""), entry("!!!")];
        assert_eq!(tally(&words(""), false, &history, PARAMS), 1);
    }

    #[test]
    fn test_history_window_bounded() {
        let history = History::new(3, Duration::from_secs(60));
        for i in 0..5 {
            history.push("viewer", &i.to_string(), entry(&format!("message {}", i)));
        }
        let bodies: Vec<String> = history
            .newest_first("viewer")
            .iter()
            .map(|e| e.body.clone())
            .collect();
        assert_eq!(bodies, vec!["message 4", "message 3", "message 2"]);
        assert_eq!(history.clear("viewer"), 3);
        assert_eq!(history.len("viewer"), 0);
    }
}
