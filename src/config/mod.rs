// src/config/mod.rs - Engine configuration: model, validation, merge and snapshot handle

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::bot::trust::Scope;
use crate::types::Punishment;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{section}: {field} = {value} is outside {min}..={max}")]
    OutOfRange {
        section: String,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{section}: invalid regex '{pattern}': {source}")]
    InvalidRegex {
        section: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{0}: 'inherit' cannot be used in the default tier")]
    InheritInDefault(&'static str),
    #[error("{0}: punishment ladder is empty")]
    EmptyLadder(&'static str),
    #[error("{0}: pattern is empty")]
    EmptyPattern(String),
}

/// Stream-state gate for the similarity check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeGate {
    Online,
    Offline,
    #[default]
    Always,
}

impl ModeGate {
    pub fn allows(self, live: bool) -> bool {
        match self {
            ModeGate::Online => live,
            ModeGate::Offline => !live,
            ModeGate::Always => true,
        }
    }
}

/// Similarity settings for one message class (default / VIP / emote-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamTier {
    pub enabled: bool,
    pub mode: ModeGate,
    pub similarity_threshold: f64,
    pub message_limit: usize,
    /// Dissimilar messages tolerated between two counted similar ones
    pub min_gap: usize,
    pub punishments: Vec<Punishment>,
    /// Offense counter reset window, seconds
    pub reset_punishments_secs: u64,
    /// Longest allowed word in characters; 0 disables the check
    pub max_word_length: usize,
    pub max_word_punishments: Vec<Punishment>,
}

impl Default for SpamTier {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ModeGate::Always,
            similarity_threshold: 0.7,
            message_limit: 4,
            min_gap: 1,
            punishments: vec![
                Punishment::Timeout(Duration::from_secs(60)),
                Punishment::Timeout(Duration::from_secs(600)),
                Punishment::Ban,
            ],
            reset_punishments_secs: 3600,
            max_word_length: 0,
            max_word_punishments: vec![Punishment::Delete],
        }
    }
}

impl SpamTier {
    fn inheriting() -> Self {
        Self {
            punishments: vec![Punishment::Inherit],
            max_word_punishments: vec![Punishment::Inherit],
            ..Self::default()
        }
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_secs(self.reset_punishments_secs)
    }

    fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        check_range(section, "similarity_threshold", self.similarity_threshold, 0.1, 1.0)?;
        check_range(section, "message_limit", self.message_limit as f64, 2.0, 15.0)?;
        check_range(section, "min_gap", self.min_gap as f64, 0.0, 15.0)?;
        Ok(())
    }
}

fn check_range(
    section: &str,
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            section: section.to_string(),
            field,
            value,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub default: SpamTier,
    pub vip: SpamTier,
    pub emote: SpamTier,
    /// Logins never checked for spam
    pub whitelist: Vec<String>,
    /// Stream categories during which the similarity check is off
    pub ignored_categories: Vec<String>,
    /// Messages kept per user for the similarity window
    pub history_capacity: usize,
    pub history_ttl_secs: u64,
    /// Users tracked at once, least recently active dropped first; 0 means unbounded
    pub history_max_users: usize,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            default: SpamTier::default(),
            vip: SpamTier::inheriting(),
            emote: SpamTier {
                message_limit: 5,
                ..SpamTier::inheriting()
            },
            whitelist: Vec::new(),
            ignored_categories: Vec::new(),
            history_capacity: 15,
            history_ttl_secs: 180,
            history_max_users: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanwordsConfig {
    pub enabled: bool,
    /// Whole words or whitespace-separated phrases
    pub exact: Vec<String>,
    /// Matched anywhere in the normalized text
    pub substring: Vec<String>,
}

impl Default for BanwordsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exact: Vec::new(),
            substring: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MwordOptions {
    pub case_sensitive: bool,
    /// Match inside words instead of whole tokens
    pub contains: bool,
    pub no_vip: bool,
    pub no_sub: bool,
}

/// Restricted words sharing one ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MwordGroup {
    pub enabled: bool,
    pub words: Vec<String>,
    pub regex: Vec<String>,
    pub punishments: Vec<Punishment>,
    pub reset_punishments_secs: u64,
    pub options: MwordOptions,
}

impl Default for MwordGroup {
    fn default() -> Self {
        Self {
            enabled: true,
            words: Vec::new(),
            regex: Vec::new(),
            punishments: vec![Punishment::Inherit],
            reset_punishments_secs: 3600,
            options: MwordOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MwordEntry {
    pub enabled: bool,
    pub word: String,
    pub regex: bool,
    pub punishments: Vec<Punishment>,
    pub reset_punishments_secs: u64,
    pub options: MwordOptions,
}

impl Default for MwordEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            word: String::new(),
            regex: false,
            punishments: vec![Punishment::Inherit],
            reset_punishments_secs: 3600,
            options: MwordOptions::default(),
        }
    }
}

impl MwordEntry {
    /// Single entries behave as a one-word group
    pub fn as_group(&self) -> MwordGroup {
        let (words, regex) = if self.regex {
            (Vec::new(), vec![self.word.clone()])
        } else {
            (vec![self.word.clone()], Vec::new())
        };
        MwordGroup {
            enabled: self.enabled,
            words,
            regex,
            punishments: self.punishments.clone(),
            reset_punishments_secs: self.reset_punishments_secs,
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MwordsConfig {
    pub enabled: bool,
    pub individual: Vec<MwordEntry>,
    pub groups: HashMap<String, MwordGroup>,
}

impl Default for MwordsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            individual: Vec::new(),
            groups: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionOptions {
    pub case_sensitive: bool,
    /// Only applies when no word in the message repeats
    pub no_repeat: bool,
    /// Only applies to single-word messages
    pub one_word: bool,
    pub no_vip: bool,
    pub no_sub: bool,
    /// Pattern may appear anywhere instead of being the whole message
    pub contains: bool,
}

/// Allowed repetition (e.g. a channel emote or a running joke) with its own limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionRule {
    pub enabled: bool,
    pub pattern: String,
    pub regex: bool,
    pub message_limit: usize,
    pub punishments: Vec<Punishment>,
    pub reset_punishments_secs: u64,
    pub options: ExceptionOptions,
}

impl Default for ExceptionRule {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern: String::new(),
            regex: false,
            message_limit: 10,
            punishments: vec![Punishment::Inherit],
            reset_punishments_secs: 3600,
            options: ExceptionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdsConfig {
    pub enabled: bool,
    pub punishment: Punishment,
}

impl Default for AdsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            punishment: Punishment::Ban,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustUserConfig {
    pub roles: Vec<String>,
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub roles: HashMap<String, Vec<Scope>>,
    pub users: HashMap<String, TrustUserConfig>,
}

/// Defaults applied to nuke rules started without explicit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NukeDefaults {
    pub duration_secs: u64,
    pub punishment: Punishment,
    /// How far back in the history window a new nuke reaches, seconds
    pub scrollback_secs: u64,
}

impl Default for NukeDefaults {
    fn default() -> Self {
        Self {
            duration_secs: 300,
            punishment: Punishment::Timeout(Duration::from_secs(600)),
            scrollback_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub enabled: bool,
    pub spam: SpamConfig,
    pub banwords: BanwordsConfig,
    pub mwords: MwordsConfig,
    pub exceptions: Vec<ExceptionRule>,
    pub emote_exceptions: Vec<ExceptionRule>,
    pub ads: AdsConfig,
    pub trust: TrustConfig,
    pub nuke: NukeDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            spam: SpamConfig::default(),
            banwords: BanwordsConfig::default(),
            mwords: MwordsConfig::default(),
            exceptions: Vec::new(),
            emote_exceptions: Vec::new(),
            ads: AdsConfig::default(),
            trust: TrustConfig::default(),
            nuke: NukeDefaults::default(),
        }
    }
}

fn check_regex(section: &str, pattern: &str) -> Result<(), ConfigError> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidRegex {
            section: section.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}

fn inherits(ladder: &[Punishment]) -> bool {
    ladder.is_empty() || ladder.contains(&Punishment::Inherit)
}

fn inherit_into(ladder: &mut Vec<Punishment>, from: &[Punishment]) {
    if inherits(ladder) {
        *ladder = from.to_vec();
    }
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML configuration")
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// Load by extension (`.toml`, otherwise YAML), then validate
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.spam.default.validate("spam.default")?;
        self.spam.vip.validate("spam.vip")?;
        self.spam.emote.validate("spam.emote")?;

        if self.spam.default.punishments.is_empty() {
            return Err(ConfigError::EmptyLadder("spam.default.punishments"));
        }
        if self.spam.default.punishments.contains(&Punishment::Inherit) {
            return Err(ConfigError::InheritInDefault("spam.default.punishments"));
        }
        if self
            .spam
            .default
            .max_word_punishments
            .contains(&Punishment::Inherit)
        {
            return Err(ConfigError::InheritInDefault("spam.default.max_word_punishments"));
        }

        for (name, group) in &self.mwords.groups {
            for pattern in &group.regex {
                check_regex(&format!("mwords.groups.{}", name), pattern)?;
            }
        }
        for (i, entry) in self.mwords.individual.iter().enumerate() {
            if entry.word.trim().is_empty() {
                return Err(ConfigError::EmptyPattern(format!("mwords.individual[{}]", i)));
            }
            if entry.regex {
                check_regex(&format!("mwords.individual[{}]", i), &entry.word)?;
            }
        }
        for (section, rules) in [
            ("exceptions", &self.exceptions),
            ("emote_exceptions", &self.emote_exceptions),
        ] {
            for (i, rule) in rules.iter().enumerate() {
                let section = format!("{}[{}]", section, i);
                if rule.pattern.trim().is_empty() {
                    return Err(ConfigError::EmptyPattern(section));
                }
                if rule.regex {
                    check_regex(&section, &rule.pattern)?;
                }
                check_range(&section, "message_limit", rule.message_limit as f64, 2.0, 15.0)?;
            }
        }
        Ok(())
    }

    /// Copy with every `inherit` (or empty) ladder replaced by the default tier's
    pub fn merged(&self) -> Self {
        let mut merged = self.clone();
        let base = self.spam.default.punishments.clone();
        let base_long = self.spam.default.max_word_punishments.clone();
        for tier in [&mut merged.spam.vip, &mut merged.spam.emote] {
            inherit_into(&mut tier.punishments, &base);
            inherit_into(&mut tier.max_word_punishments, &base_long);
        }
        for group in merged.mwords.groups.values_mut() {
            inherit_into(&mut group.punishments, &base);
        }
        for entry in &mut merged.mwords.individual {
            inherit_into(&mut entry.punishments, &base);
        }
        for rule in merged.exceptions.iter_mut() {
            inherit_into(&mut rule.punishments, &base);
        }
        let emote_base = merged.spam.emote.punishments.clone();
        for rule in merged.emote_exceptions.iter_mut() {
            inherit_into(&mut rule.punishments, &emote_base);
        }
        if merged.nuke.punishment == Punishment::Inherit {
            merged.nuke.punishment = base.first().copied().unwrap_or(Punishment::Delete);
        }
        merged
    }
}

/// Configuration as written (with `inherit` markers) next to its merged form
#[derive(Debug)]
struct Published {
    raw: Arc<EngineConfig>,
    merged: Arc<EngineConfig>,
}

impl Published {
    fn new(config: EngineConfig) -> Self {
        let merged = Arc::new(config.merged());
        Self {
            raw: Arc::new(config),
            merged,
        }
    }
}

/// Versioned, immutable configuration snapshots. Readers clone an `Arc`;
/// writers edit the unmerged configuration, then merge and swap it in, so
/// `inherit` keeps following the default tier across updates.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Published>,
    version: AtomicU64,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Published::new(config)),
            version: AtomicU64::new(1),
        })
    }

    /// Merged snapshot used for decisions
    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .merged
            .clone()
    }

    /// Configuration as last written, before `inherit` resolution
    pub fn raw(&self) -> Arc<EngineConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .raw
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Validate, merge and publish; returns the new version
    pub fn replace(&self, config: EngineConfig) -> Result<u64, ConfigError> {
        if let Err(e) = config.validate() {
            warn!("Rejected configuration update: {}", e);
            return Err(e);
        }
        let published = Published::new(config);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = published;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!("Configuration updated to version {}", version);
        Ok(version)
    }

    /// Edit a copy of the unmerged configuration and publish it
    pub fn update<F>(&self, edit: F) -> Result<u64, ConfigError>
    where
        F: FnOnce(&mut EngineConfig),
    {
        let mut next = (*self.raw()).clone();
        edit(&mut next);
        self.replace(next)
    }
}
