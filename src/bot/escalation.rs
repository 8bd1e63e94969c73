// src/bot/escalation.rs - Punishment ladders and per-user offense counters

use log::debug;
use std::time::Duration;

use crate::store::{StoreOptions, TimerKey, TimingWheel, TtlStore};
use crate::types::Punishment;

/// Step for the `offense`-th (0-based) offense; past the end the last step repeats.
/// An empty ladder only deletes the message.
pub fn resolve(ladder: &[Punishment], offense: usize) -> Punishment {
    match ladder.len() {
        0 => Punishment::Delete,
        len => ladder[offense.min(len - 1)],
    }
}

/// Offense counters per user and surface ("mword", "spam", an exception name...).
/// A counter resets once the user stays clean for its reset window.
#[derive(Clone)]
pub struct OffenseCounters {
    store: TtlStore<String, String, usize>,
}

impl OffenseCounters {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            store: TtlStore::new(options),
        }
    }

    pub fn wheel(&self) -> std::sync::Arc<TimingWheel<TimerKey<String, String>>> {
        self.store.wheel()
    }

    pub fn count(&self, user: &str, surface: &str) -> usize {
        self.store
            .get(&user.to_string(), &surface.to_string())
            .unwrap_or(0)
    }

    /// Resolve the user's next step on `ladder` and bump the counter, restarting
    /// its reset window
    pub fn escalate(
        &self,
        user: &str,
        surface: &str,
        ladder: &[Punishment],
        reset_after: Duration,
    ) -> Punishment {
        let mut step = Punishment::Delete;
        self.store.update_with_ttl(
            user.to_string(),
            surface.to_string(),
            Some(reset_after),
            |previous| {
                let offense = previous.copied().unwrap_or(0);
                step = resolve(ladder, offense);
                Some(offense + 1)
            },
        );
        debug!("{} offense on '{}' resolved to {}", user, surface, step);
        step
    }

    pub fn reset(&self, user: &str) -> usize {
        self.store.clear_key(&user.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<Punishment> {
        vec![
            Punishment::Timeout(Duration::from_secs(60)),
            Punishment::Timeout(Duration::from_secs(600)),
            Punishment::Ban,
        ]
    }

    #[test]
    fn test_resolve_clamps_to_last_step() {
        let ladder = ladder();
        assert_eq!(resolve(&ladder, 0), Punishment::Timeout(Duration::from_secs(60)));
        assert_eq!(resolve(&ladder, 1), Punishment::Timeout(Duration::from_secs(600)));
        assert_eq!(resolve(&ladder, 2), Punishment::Ban);
        assert_eq!(resolve(&ladder, 5), Punishment::Ban);
        assert_eq!(resolve(&[], 3), Punishment::Delete);
    }

    #[test]
    fn test_counters_escalate_and_reset() {
        let tick = Duration::from_millis(100);
        let counters = OffenseCounters::new(StoreOptions::default().with_wheel(tick, 32));
        let ladder = ladder();
        let reset = tick * 10;

        assert_eq!(
            counters.escalate("viewer", "mword", &ladder, reset),
            Punishment::Timeout(Duration::from_secs(60))
        );
        assert_eq!(
            counters.escalate("viewer", "mword", &ladder, reset),
            Punishment::Timeout(Duration::from_secs(600))
        );
        assert_eq!(counters.count("viewer", "mword"), 2);
        assert_eq!(counters.count("viewer", "spam"), 0);

        // quiet for the whole reset window
        counters.wheel().advance_by(10);
        assert_eq!(counters.count("viewer", "mword"), 0);
        assert_eq!(
            counters.escalate("viewer", "mword", &ladder, reset),
            Punishment::Timeout(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_reset_window_outlives_store_ttl() {
        let tick = Duration::from_millis(100);
        let counters = OffenseCounters::new(
            StoreOptions::default()
                .with_ttl(tick * 5)
                .with_wheel(tick, 32),
        );
        counters.escalate("viewer", "spam", &ladder(), tick * 40);

        counters.wheel().advance_by(20);
        assert_eq!(counters.count("viewer", "spam"), 1);

        counters.wheel().advance_by(25);
        assert_eq!(counters.count("viewer", "spam"), 0);
    }

    #[test]
    fn test_surfaces_are_independent() {
        let counters = OffenseCounters::new(StoreOptions::default());
        let ladder = ladder();
        counters.escalate("viewer", "mword", &ladder, Duration::from_secs(60));
        assert_eq!(
            counters.escalate("viewer", "spam", &ladder, Duration::from_secs(60)),
            Punishment::Timeout(Duration::from_secs(60))
        );
        assert_eq!(counters.reset("viewer"), 2);
    }
}
