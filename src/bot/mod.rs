// src/bot/mod.rs - Spam detector: per-message decision pipeline and live admin controls

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

use crate::config::{ConfigError, ConfigHandle, EngineConfig, SpamTier};
use crate::matcher::Swappable;
use crate::store::{StoreOptions, Tick, TimingWheel, WheelDriver};
use crate::text::{NormalizedText, Transform};
use crate::types::{Action, ChatMessage};

pub mod escalation;
pub mod nuke;
pub mod rules;
pub mod similarity;
pub mod trust;

use escalation::OffenseCounters;
use nuke::{ActiveNuke, NukeRule, NukeSlot};
use rules::{Exception, RuleSet};
use similarity::{tally, History, HistoryEntry, TallyParams};
use trust::{Scope, TrustResolver, TrustTable};

/// Live stream status supplied by the platform adapter
pub trait StreamState: Send + Sync {
    fn is_live(&self) -> bool;
    fn category(&self) -> Option<String>;
}

/// Stream state set by hand (replay tool, tests, adapters that push updates)
#[derive(Debug, Default)]
pub struct ManualStream {
    live: AtomicBool,
    category: RwLock<Option<String>>,
}

impl ManualStream {
    pub fn new(live: bool, category: Option<&str>) -> Self {
        Self {
            live: AtomicBool::new(live),
            category: RwLock::new(category.map(str::to_string)),
        }
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn set_category(&self, category: Option<&str>) {
        *self.category.write().unwrap_or_else(|e| e.into_inner()) = category.map(str::to_string);
    }
}

impl StreamState for ManualStream {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn category(&self) -> Option<String> {
        self.category.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Timers the detector schedules for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlTimer {
    Nuke,
    SpamPause,
}

/// Limit crossed by a run of near-duplicates
enum SpamHit<'a> {
    Exception(&'a Exception),
    Tier(&'a SpamTier),
}

/// A link to the sender's own channel posted in someone else's chat
fn is_self_promotion(msg: &ChatMessage, user: &str) -> bool {
    if msg.channel.eq_ignore_ascii_case(user) {
        return false;
    }
    msg.body().split_whitespace().any(|token| {
        let token = token.trim_matches(|c: char| {
            matches!(c, '(' | ')' | '<' | '>' | '"' | '\'' | ',' | '!' | '?')
        });
        if !token.to_lowercase().contains("twitch.tv") {
            return false;
        }
        let candidate = if token.contains("://") {
            token.to_string()
        } else {
            format!("https://{}", token)
        };
        let Ok(url) = Url::parse(&candidate) else {
            return false;
        };
        let on_twitch = url
            .host_str()
            .is_some_and(|host| host == "twitch.tv" || host.ends_with(".twitch.tv"));
        on_twitch
            && url
                .path_segments()
                .and_then(|mut segments| segments.next())
                .is_some_and(|login| login.eq_ignore_ascii_case(user))
    })
}

/// Chat moderation core. `check` is safe to call concurrently for any number
/// of users; admin mutators may run alongside.
pub struct SpamDetector {
    config: ConfigHandle,
    rules: Swappable<RuleSet>,
    trust: TrustTable,
    history: History,
    offenses: OffenseCounters,
    nuke: Arc<NukeSlot>,
    paused: Arc<AtomicBool>,
    control: Arc<TimingWheel<ControlTimer>>,
    stream: Arc<dyn StreamState>,
}

impl SpamDetector {
    pub fn new(config: EngineConfig, stream: Arc<dyn StreamState>) -> Result<Self, ConfigError> {
        let config = ConfigHandle::new(config)?;
        let snapshot = config.snapshot();
        let rules = RuleSet::build(&snapshot)?;
        let history = History::with_options(
            StoreOptions::default()
                .with_ttl(Duration::from_secs(snapshot.spam.history_ttl_secs))
                .with_capacity(snapshot.spam.history_capacity)
                .with_max_keys(snapshot.spam.history_max_users),
        );
        info!(
            "Spam detector ready: history {} messages / {}s",
            snapshot.spam.history_capacity, snapshot.spam.history_ttl_secs
        );
        Ok(Self {
            trust: TrustTable::from_config(&snapshot.trust),
            rules: Swappable::new(rules),
            history,
            offenses: OffenseCounters::new(StoreOptions::default()),
            nuke: Arc::new(NukeSlot::default()),
            paused: Arc::new(AtomicBool::new(false)),
            control: Arc::new(TimingWheel::new(
                TimingWheel::<ControlTimer>::DEFAULT_TICK,
                TimingWheel::<ControlTimer>::DEFAULT_SLOTS,
            )),
            stream,
            config,
        })
    }

    /// Every wheel that needs ticking
    pub fn wheels(&self) -> Vec<Arc<dyn Tick>> {
        let wheels: [Arc<dyn Tick>; 3] = [
            self.history.wheel(),
            self.offenses.wheel(),
            self.control.clone(),
        ];
        wheels.into()
    }

    pub fn register(&self, driver: &mut WheelDriver) {
        for wheel in self.wheels() {
            driver.register(wheel);
        }
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.snapshot()
    }

    pub fn config_version(&self) -> u64 {
        self.config.version()
    }

    pub fn trust(&self) -> &TrustTable {
        &self.trust
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn check(&self, msg: &ChatMessage) -> Action {
        self.check_with(msg, true)
    }

    /// Decide what to do with `msg`; `spam_enabled = false` skips only the
    /// similarity step
    pub fn check_with(&self, msg: &ChatMessage, spam_enabled: bool) -> Action {
        let action = self.evaluate(msg, spam_enabled);
        if !action.is_none() {
            info!(
                "{:?} {} in #{} ({}): {}",
                action.kind, msg.username, msg.channel, action.reason, msg.content
            );
        }
        action
    }

    fn evaluate(&self, msg: &ChatMessage, spam_enabled: bool) -> Action {
        let config = self.config.snapshot();
        if !config.enabled {
            return Action::none();
        }
        let user = msg.username.to_lowercase();
        let scopes = self.trust.mask(&user);
        if msg.is_broadcaster
            || msg.is_mod
            || scopes.contains(Scope::IgnoreAntispam)
            || config.spam.whitelist.iter().any(|w| w.eq_ignore_ascii_case(&user))
        {
            return Action::none();
        }

        let text = NormalizedText::new(msg.body());
        if let Some(nuke) = self.nuke.current() {
            if nuke.matches(&text) {
                return nuke.action();
            }
        }

        let rules = self.rules.load();
        if !scopes.contains(Scope::IgnoreBanwords) {
            if let Some(word) = rules.banwords.find(&text) {
                return Action::ban(format!("banword: {}", word));
            }
        }

        if config.ads.enabled
            && !scopes.contains(Scope::IgnoreAds)
            && is_self_promotion(msg, &user)
        {
            return Action::from_punishment(config.ads.punishment, "advertising");
        }

        if !scopes.contains(Scope::IgnoreMword) {
            if let Some(rule) = rules.mwords.find(msg, &text) {
                let step = self
                    .offenses
                    .escalate(&user, &rule.name, &rule.punishments, rule.reset_after);
                return Action::from_punishment(step, rule.name.clone());
            }
        }

        // skipped messages are kept for nuke scrollback but never counted
        let tier = if spam_enabled {
            self.spam_tier(&config, msg)
        } else {
            None
        };
        if let Some(tier) = tier {
            if let Some(action) = self.long_word(tier, &user, &text) {
                return action;
            }
        }
        let exceptions = if msg.emote_only {
            &rules.emote_exceptions
        } else {
            &rules.exceptions
        };
        let exception = tier.and_then(|_| exceptions.find(msg, &text));

        let entry = HistoryEntry {
            words: text.words(Transform::CANONICAL),
            emote_only: msg.emote_only,
            ignore: tier.is_none() || text.original().trim_start().starts_with('!'),
            body: msg.body().to_string(),
            at: msg.timestamp,
        };
        // tally, decision and append happen under the user's lock
        let hit = self.history.with_window(&user, |window| {
            let hit = tier.and_then(|tier| {
                let count = tally(
                    &entry.words,
                    msg.emote_only,
                    window.newest_first().map(|(_, e)| &**e),
                    TallyParams {
                        threshold: tier.similarity_threshold,
                        min_gap: tier.min_gap,
                    },
                );
                debug!("{} similarity tally {}/{}", user, count, tier.message_limit);
                match exception {
                    Some(exception) if count >= exception.message_limit => {
                        Some(SpamHit::Exception(exception))
                    }
                    Some(_) => None,
                    None if count >= tier.message_limit => Some(SpamHit::Tier(tier)),
                    None => None,
                }
            });
            match hit {
                Some(_) => {
                    window.clear();
                }
                None => window.push(msg.message_id.clone(), Arc::new(entry)),
            }
            hit
        });

        match hit {
            Some(SpamHit::Exception(exception)) => {
                let step = self.offenses.escalate(
                    &user,
                    &exception.name,
                    &exception.punishments,
                    exception.reset_after,
                );
                Action::from_punishment(step, exception.name.clone())
            }
            Some(SpamHit::Tier(tier)) => {
                let surface = if msg.emote_only { "spam:emote" } else { "spam" };
                let step = self
                    .offenses
                    .escalate(&user, surface, &tier.punishments, tier.reset_after());
                Action::from_punishment(step, surface)
            }
            None => Action::none(),
        }
    }

    fn tier<'a>(config: &'a EngineConfig, msg: &ChatMessage) -> Option<&'a SpamTier> {
        if msg.is_vip && !config.spam.vip.enabled {
            return None;
        }
        let tier = if msg.emote_only {
            &config.spam.emote
        } else if msg.is_vip {
            &config.spam.vip
        } else {
            &config.spam.default
        };
        tier.enabled.then_some(tier)
    }

    /// Tier that judges `msg`, or `None` when the similarity check is off
    /// for it (paused, tier disabled, gated by stream state)
    fn spam_tier<'a>(
        &self,
        config: &'a EngineConfig,
        msg: &ChatMessage,
    ) -> Option<&'a SpamTier> {
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        let tier = Self::tier(config, msg)?;
        if !tier.mode.allows(self.stream.is_live()) {
            return None;
        }
        if let Some(category) = self.stream.category() {
            if config
                .spam
                .ignored_categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&category))
            {
                return None;
            }
        }
        Some(tier)
    }

    fn long_word(&self, tier: &SpamTier, user: &str, text: &NormalizedText) -> Option<Action> {
        if tier.max_word_length == 0
            || !text
                .tokenize(&[Transform::StripInvisible])
                .iter()
                .any(|w| w.chars().count() > tier.max_word_length)
        {
            return None;
        }
        let step = self.offenses.escalate(
            user,
            "spam:long-word",
            &tier.max_word_punishments,
            tier.reset_after(),
        );
        Some(Action::from_punishment(step, "long word"))
    }

    /// Validate and publish a new configuration, rebuilding rules and trust.
    /// Nothing changes when validation or compilation fails.
    pub fn apply_config(&self, config: EngineConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let rules = RuleSet::build(&config.merged())?;
        let version = self.config.replace(config)?;
        let snapshot = self.config.snapshot();
        self.rules.swap(rules);
        self.trust.load(&snapshot.trust);
        if self.history.capacity() != snapshot.spam.history_capacity {
            self.history.set_capacity(snapshot.spam.history_capacity);
        }
        if self.history.max_users() != snapshot.spam.history_max_users {
            self.history.set_max_users(snapshot.spam.history_max_users);
        }
        let ttl = Duration::from_secs(snapshot.spam.history_ttl_secs);
        if self.history.ttl() != ttl {
            self.history.set_ttl(ttl);
        }
        Ok(version)
    }

    /// Copy the current configuration, edit it and apply the result
    pub fn update_config<F>(&self, edit: F) -> Result<u64, ConfigError>
    where
        F: FnOnce(&mut EngineConfig),
    {
        let mut next = (*self.config.raw()).clone();
        edit(&mut next);
        self.apply_config(next)
    }

    /// Recompile phrase matchers from the current configuration
    pub fn rebuild_rules(&self) -> Result<(), ConfigError> {
        let rules = RuleSet::build(&self.config.snapshot())?;
        self.rules.swap(rules);
        info!("Rebuilt rule matchers");
        Ok(())
    }

    /// Reload roles and users from the current configuration
    pub fn rebuild_trust(&self) {
        self.trust.load(&self.config.snapshot().trust);
    }

    pub fn set_history_capacity(&self, capacity: usize) {
        self.history.set_capacity(capacity);
    }

    pub fn set_history_ttl(&self, ttl: Duration) {
        self.history.set_ttl(ttl);
    }

    pub fn history_ttl(&self) -> Duration {
        self.history.ttl()
    }

    /// Forget a user's window and offense counters
    pub fn forgive(&self, user: &str) {
        let user = user.to_lowercase();
        self.history.clear(&user);
        self.offenses.reset(&user);
    }

    /// Rule for a nuke using the configured defaults
    pub fn nuke_rule(&self) -> NukeRule {
        NukeRule::new(&self.config.snapshot().nuke)
    }

    /// Install `rule` for live messages until it expires or is cancelled, and
    /// return actions for users whose recent messages it already matches
    pub fn start_nuke(&self, rule: &NukeRule) -> Result<Vec<(String, Action)>, ConfigError> {
        let generation = self.nuke.next_generation();
        let nuke = self.nuke.install(ActiveNuke::compile(rule, generation)?);

        let slot = Arc::downgrade(&self.nuke);
        self.control.add(
            ControlTimer::Nuke,
            rule.duration,
            false,
            Arc::new(move || {
                if let Some(slot) = slot.upgrade() {
                    slot.expire(generation);
                }
            }),
        );

        let hits: Vec<(String, Action)> = nuke
            .sweep(&self.history)
            .into_iter()
            .filter(|(user, _)| !self.trust.has_scope(user, Scope::IgnoreAntispam))
            .collect();
        info!("Nuke #{} swept {} users from history", generation, hits.len());
        Ok(hits)
    }

    pub fn cancel_nuke(&self) -> bool {
        self.control.remove(&ControlTimer::Nuke);
        self.nuke.cancel()
    }

    pub fn nuke_active(&self) -> bool {
        self.nuke.current().is_some()
    }

    /// Suspend the similarity check for `duration`; zero resumes immediately
    pub fn pause_spam(&self, duration: Duration) {
        if duration.is_zero() {
            self.control.remove(&ControlTimer::SpamPause);
            self.paused.store(false, Ordering::Release);
            info!("Spam checking resumed");
            return;
        }
        self.paused.store(true, Ordering::Release);
        let paused = Arc::downgrade(&self.paused);
        self.control.add(
            ControlTimer::SpamPause,
            duration,
            false,
            Arc::new(move || {
                if let Some(paused) = paused.upgrade() {
                    paused.store(false, Ordering::Release);
                    info!("Spam pause elapsed");
                }
            }),
        );
        info!("Spam checking paused for {:?}", duration);
    }

    pub fn spam_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MwordGroup, ModeGate};
    use crate::types::{ActionKind, Punishment};
    use std::collections::HashMap;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.spam.default.message_limit = 3;
        config
    }

    fn detector_with(config: EngineConfig) -> (SpamDetector, Arc<ManualStream>) {
        let stream = Arc::new(ManualStream::new(true, Some("Gaming")));
        let detector = SpamDetector::new(config, stream.clone()).unwrap();
        (detector, stream)
    }

    fn detector() -> SpamDetector {
        detector_with(config()).0
    }

    fn message(id: usize, user: &str, content: &str) -> ChatMessage {
        ChatMessage::new(id.to_string(), "streamer", user, content)
    }

    fn spam(detector: &SpamDetector, user: &str, content: &str, times: usize) -> Vec<Action> {
        (0..times)
            .map(|i| detector.check(&message(i, user, content)))
            .collect()
    }

    #[test_log::test]
    fn test_repeated_message_times_out_and_clears_window() {
        let detector = detector();
        let actions = spam(&detector, "viewer", "buy cheap followers now", 3);
        assert!(actions[0].is_none());
        assert!(actions[1].is_none());
        assert_eq!(actions[2].kind, ActionKind::Timeout);
        assert_eq!(actions[2].duration, Duration::from_secs(60));
        assert_eq!(detector.history().len("viewer"), 0);

        // second offense climbs the ladder
        let actions = spam(&detector, "viewer", "buy cheap followers now", 3);
        assert_eq!(actions[2].duration, Duration::from_secs(600));
    }

    #[test]
    fn test_broadcaster_and_mod_bypass() {
        let detector = detector();
        for i in 0..10 {
            let mut msg = message(i, "streamer", "buy cheap followers now");
            msg.is_broadcaster = true;
            assert!(detector.check(&msg).is_none());
            let mut msg = message(i, "moderator", "buy cheap followers now");
            msg.is_mod = true;
            assert!(detector.check(&msg).is_none());
        }
    }

    #[test]
    fn test_banword_bans_regardless_of_history() {
        let mut config = config();
        config.banwords.substring = vec!["пидор".to_string()];
        let (detector, _) = detector_with(config);
        let action = detector.check(&message(1, "viewer", "ты пидорас"));
        assert_eq!(action.kind, ActionKind::Ban);
        assert!(action.reason.starts_with("banword"));
    }

    #[test]
    fn test_disabled_vip_tier_skips_similarity_only() {
        let mut config = config();
        config.spam.vip.enabled = false;
        config.mwords.groups.insert(
            "links".to_string(),
            MwordGroup {
                words: vec!["discord".to_string()],
                punishments: vec![Punishment::Delete],
                ..MwordGroup::default()
            },
        );
        let (detector, _) = detector_with(config);
        for i in 0..6 {
            let mut msg = message(i, "vipper", "buy cheap followers now");
            msg.is_vip = true;
            assert!(detector.check(&msg).is_none());
        }
        let mut msg = message(7, "vipper", "join my discord");
        msg.is_vip = true;
        assert_eq!(detector.check(&msg).kind, ActionKind::Delete);
    }

    #[test]
    fn test_mword_offenses_escalate() {
        let mut config = config();
        config.mwords.groups.insert(
            "scam".to_string(),
            MwordGroup {
                words: vec!["free nitro".to_string()],
                punishments: vec![Punishment::Warn, Punishment::Timeout(Duration::from_secs(30))],
                ..MwordGroup::default()
            },
        );
        let (detector, _) = detector_with(config);
        let first = detector.check(&message(1, "viewer", "FREE nitro here"));
        assert_eq!(first.kind, ActionKind::Warn);
        assert_eq!(first.reason, "mword:scam");
        let second = detector.check(&message(2, "viewer", "free   nitro!!"));
        assert_eq!(second.kind, ActionKind::Timeout);
        assert_eq!(second.duration, Duration::from_secs(30));
    }

    #[test]
    fn test_self_promotion_is_advertising() {
        let detector = detector();
        let action = detector.check(&message(1, "viewer", "come watch twitch.tv/Viewer now"));
        assert_eq!(action.kind, ActionKind::Ban);
        assert_eq!(action.reason, "advertising");
        assert!(detector
            .check(&message(2, "viewer", "clip: https://www.twitch.tv/streamer/clip/abc"))
            .is_none());
    }

    #[test]
    fn test_exception_raises_limit() {
        let mut config = config();
        config.exceptions.push(crate::config::ExceptionRule {
            pattern: "gg".to_string(),
            message_limit: 5,
            ..Default::default()
        });
        let (detector, _) = detector_with(config);
        let actions = spam(&detector, "viewer", "GG", 5);
        assert!(actions[..4].iter().all(Action::is_none));
        assert_eq!(actions[4].kind, ActionKind::Timeout);
        assert_eq!(actions[4].reason, "exception:gg");
    }

    fn emote(id: usize, user: &str, content: &str) -> ChatMessage {
        let mut msg = message(id, user, content);
        msg.emote_only = true;
        msg
    }

    #[test]
    fn test_emote_only_uses_emote_tier() {
        let mut config = config();
        config.spam.emote.punishments = vec![Punishment::Delete];
        let (detector, _) = detector_with(config);

        for i in 0..4 {
            assert!(detector.check(&emote(i, "viewer", "Kappa")).is_none());
        }
        // text messages neither count toward nor reuse the emote run
        for i in 4..6 {
            assert!(detector.check(&message(i, "viewer", "Kappa")).is_none());
        }
        let action = detector.check(&emote(6, "viewer", "Kappa"));
        assert_eq!(action.kind, ActionKind::Delete);
        assert_eq!(action.reason, "spam:emote");
        assert_eq!(detector.history().len("viewer"), 0);

        let actions: Vec<Action> = (7..10)
            .map(|i| detector.check(&message(i, "viewer", "Kappa")))
            .collect();
        assert!(actions[..2].iter().all(Action::is_none));
        assert_eq!(actions[2].kind, ActionKind::Timeout);
        assert_eq!(actions[2].duration, Duration::from_secs(60));
        assert_eq!(actions[2].reason, "spam");
    }

    #[test]
    fn test_emote_exception_overrides_emote_limit() {
        let mut config = config();
        config.spam.emote.punishments = vec![Punishment::Delete];
        config.emote_exceptions.push(crate::config::ExceptionRule {
            pattern: "kappa".to_string(),
            message_limit: 7,
            ..Default::default()
        });
        let (detector, _) = detector_with(config);

        let actions: Vec<Action> = (0..7)
            .map(|i| detector.check(&emote(i, "viewer", "Kappa")))
            .collect();
        assert!(actions[..6].iter().all(Action::is_none));
        assert_eq!(actions[6].kind, ActionKind::Delete);
        assert_eq!(actions[6].reason, "exception:kappa");

        // emote exceptions never apply to text messages
        let actions = spam(&detector, "other", "Kappa", 3);
        assert_eq!(actions[2].kind, ActionKind::Timeout);
        assert_eq!(actions[2].reason, "spam");
    }

    #[test]
    fn test_mode_gate_and_category() {
        let mut config = config();
        config.spam.default.mode = ModeGate::Offline;
        config.spam.ignored_categories = vec!["just chatting".to_string()];
        let (detector, stream) = detector_with(config);
        assert!(spam(&detector, "viewer", "same text again", 4).iter().all(Action::is_none));

        stream.set_live(false);
        stream.set_category(Some("Just Chatting"));
        assert!(spam(&detector, "other", "same text again", 4).iter().all(Action::is_none));

        stream.set_category(None);
        let actions = spam(&detector, "third", "same text again", 3);
        assert_eq!(actions[2].kind, ActionKind::Timeout);
    }

    #[test]
    fn test_long_word_punished_first() {
        let mut config = config();
        config.spam.default.max_word_length = 10;
        let (detector, _) = detector_with(config);
        let action = detector.check(&message(1, "viewer", "aaaaaaaaaaaaaaaaaaaa"));
        assert_eq!(action.kind, ActionKind::Delete);
        assert_eq!(action.reason, "long word");
    }

    #[test]
    fn test_trust_scope_bypass() {
        let detector = detector();
        detector.trust().add_role("regular", &[Scope::IgnoreAntispam]);
        detector.trust().update("viewer", &["regular"], &[]);
        assert!(spam(&detector, "viewer", "buy cheap followers now", 5)
            .iter()
            .all(Action::is_none));

        detector.trust().delete_role("regular", None);
        let actions = spam(&detector, "viewer", "buy cheap followers now", 3);
        assert_eq!(actions[2].kind, ActionKind::Timeout);
    }

    #[test]
    fn test_nuke_live_retroactive_and_expiry() {
        let detector = detector();
        detector.check(&message(1, "early", "free followers at example"));
        detector.check(&message(2, "bystander", "hello there"));

        let rule = detector
            .nuke_rule()
            .phrase("free followers")
            .punishment(Punishment::Timeout(Duration::from_secs(300)))
            .duration(Duration::from_secs(2));
        let swept = detector.start_nuke(&rule).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, "early");

        let action = detector.check(&message(3, "late", "FREE followers!!"));
        assert_eq!(action.kind, ActionKind::Timeout);
        assert_eq!(action.reason, "nuke");

        // 2s at 100ms per tick
        detector.control.advance_by(20);
        assert!(!detector.nuke_active());
        assert!(!detector.cancel_nuke());
        assert!(detector.check(&message(4, "later", "free followers")).is_none());
    }

    #[test]
    fn test_nuke_cancel_is_idempotent() {
        let detector = detector();
        let rule = detector.nuke_rule().regex(r"spam\d+");
        detector.start_nuke(&rule).unwrap();
        assert!(detector.cancel_nuke());
        assert!(!detector.cancel_nuke());
        assert!(detector.check(&message(1, "viewer", "spam123")).is_none());
    }

    #[test]
    fn test_spam_pause_self_clears() {
        let detector = detector();
        detector.pause_spam(Duration::from_secs(1));
        assert!(spam(&detector, "viewer", "same text again", 3).iter().all(Action::is_none));
        detector.control.advance_by(10);
        assert!(!detector.spam_paused());

        detector.pause_spam(Duration::from_secs(60));
        detector.pause_spam(Duration::ZERO);
        assert!(!detector.spam_paused());
        assert!(detector.control.is_empty());
    }

    #[test]
    fn test_apply_config_swaps_rules() {
        let detector = detector();
        assert!(detector.check(&message(1, "viewer", "badword")).is_none());

        let version = detector
            .update_config(|c| c.banwords.exact.push("badword".to_string()))
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(detector.check(&message(2, "viewer", "badword")).kind, ActionKind::Ban);

        let err = detector.update_config(|c| c.spam.default.similarity_threshold = 2.0);
        assert!(err.is_err());
        assert_eq!(detector.config_version(), 2);
    }

    #[test]
    fn test_update_config_keeps_vip_ladder_inheriting() {
        let detector = detector();
        detector
            .update_config(|c| c.spam.default.punishments = vec![Punishment::Ban])
            .unwrap();
        let actions: Vec<Action> = (0..4)
            .map(|i| {
                let mut msg = message(i, "vipper", "buy cheap followers now");
                msg.is_vip = true;
                detector.check(&msg)
            })
            .collect();
        assert!(actions[..3].iter().all(Action::is_none));
        assert_eq!(actions[3].kind, ActionKind::Ban);

        // a second edit still starts from the unmerged document
        detector.update_config(|c| c.spam.whitelist.clear()).unwrap();
        assert_eq!(detector.config().spam.vip.punishments, vec![Punishment::Ban]);
    }

    #[test]
    fn test_history_user_limit() {
        let mut config = config();
        config.spam.history_max_users = 2;
        let (detector, _) = detector_with(config);
        for (i, user) in ["first", "second", "third"].into_iter().enumerate() {
            detector.check(&message(i, user, "hello chat"));
            detector.history().wheel().advance();
        }
        let mut users = detector.history().users();
        users.sort();
        assert_eq!(users, vec!["second".to_string(), "third".to_string()]);

        detector.update_config(|c| c.spam.history_max_users = 1).unwrap();
        assert_eq!(detector.history().users(), vec!["third".to_string()]);
    }

    #[test]
    fn test_concurrent_duplicates_counted_once_each() {
        let detector = detector();
        let actions: Vec<Action> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..6)
                .map(|t| {
                    let detector = &detector;
                    scope.spawn(move || {
                        (0..5)
                            .map(|i| {
                                let msg = ChatMessage::new(
                                    format!("{}-{}", t, i),
                                    "streamer",
                                    "viewer",
                                    "buy cheap followers now",
                                );
                                detector.check(&msg)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });
        // 30 messages, every third one closes a run of 3
        assert_eq!(actions.iter().filter(|a| !a.is_none()).count(), 10);
        assert_eq!(detector.history().len("viewer"), 0);
    }

    #[test]
    fn test_apply_config_reloads_trust() {
        let detector = detector();
        let mut roles = HashMap::new();
        roles.insert("mod".to_string(), vec![Scope::ModActions]);
        detector
            .update_config(|c| {
                c.trust.roles = roles;
                c.trust.users.insert(
                    "someone".to_string(),
                    crate::config::TrustUserConfig {
                        roles: vec!["mod".to_string()],
                        scopes: Vec::new(),
                    },
                );
            })
            .unwrap();
        assert!(detector.trust().has_scope("someone", Scope::ModActions));
    }

    #[test]
    fn test_commands_and_unchecked_messages_never_count() {
        let detector = detector();
        assert!(spam(&detector, "viewer", "!points", 6).iter().all(Action::is_none));
        for i in 0..3 {
            assert!(detector.check_with(&message(i, "quiet", "same text"), false).is_none());
        }
        assert!(detector.check(&message(9, "quiet", "same text")).is_none());
    }

    #[tokio::test]
    async fn test_driver_expires_history() {
        let mut config = config();
        config.spam.history_ttl_secs = 1;
        let (detector, _) = detector_with(config);
        let mut driver = WheelDriver::new(Duration::from_millis(10));
        detector.register(&mut driver);
        let handle = driver.spawn();

        detector.check(&message(1, "viewer", "hello"));
        assert_eq!(detector.history().len("viewer"), 1);
        // 10 wheel ticks at 10ms driver interval
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(detector.history().len("viewer"), 0);
        handle.shutdown().await;
    }
}
