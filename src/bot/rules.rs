// src/bot/rules.rs - Compiled banword, restricted-word and exception rule sets

use aho_corasick::AhoCorasick;
use log::{info, warn};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    BanwordsConfig, ConfigError, EngineConfig, ExceptionOptions, ExceptionRule, MwordGroup,
    MwordOptions, MwordsConfig,
};
use crate::matcher::{CompiledAlternation, PhraseMatcher};
use crate::text::layout::swap_layout;
use crate::text::{normalize, NormalizedText, Transform};
use crate::types::{ChatMessage, Punishment};

/// Case-preserving pipeline for case-sensitive rules
const CASED: &[Transform] = &[Transform::StripInvisible, Transform::StripPunctuation];

/// Invisible characters stripped, nothing else; case-sensitive regexes run against this
const RAW: &[Transform] = &[Transform::StripInvisible];

/// Lookalikes folded, case and punctuation kept; case-insensitive regexes run against this
const FOLDED: &[Transform] = &[Transform::StripInvisible, Transform::Homoglyphs];

fn invalid_regex(section: &str, pattern: &str, source: regex::Error) -> ConfigError {
    ConfigError::InvalidRegex {
        section: section.to_string(),
        pattern: pattern.to_string(),
        source,
    }
}

/// Hard-banned words: whole words/phrases plus substrings, also checked on
/// the message as it reads on the other keyboard layout
#[derive(Debug, Default)]
pub struct BanwordRules {
    exact: PhraseMatcher<String>,
    substring: Option<AhoCorasick>,
    substrings: Vec<String>,
}

impl BanwordRules {
    pub fn build(config: &BanwordsConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        let exact = PhraseMatcher::build_with(
            config.exact.iter().map(|w| (w.clone(), w.clone())),
            Transform::MATCHING,
        );
        let substrings: Vec<String> = config
            .substring
            .iter()
            .map(|w| normalize(w, Transform::MATCHING))
            .filter(|w| !w.trim().is_empty())
            .collect();
        let substring = if substrings.is_empty() {
            None
        } else {
            match AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(&substrings)
            {
                Ok(matcher) => Some(matcher),
                Err(e) => {
                    warn!("Failed to build banword substring matcher, substrings disabled: {}", e);
                    None
                }
            }
        };
        Self {
            exact,
            substring,
            substrings,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.substring.is_none()
    }

    fn check<S: AsRef<str>>(&self, text: &str, tokens: &[S]) -> Option<String> {
        if let Some(found) = self.exact.find(text, tokens) {
            return Some(found.value.clone());
        }
        let matcher = self.substring.as_ref()?;
        let squashed: String = text.split_whitespace().collect();
        matcher
            .find(text)
            .or_else(|| matcher.find(&squashed))
            .and_then(|m| self.substrings.get(m.pattern().as_usize()).cloned())
    }

    /// The banned word found in the message, if any
    pub fn find(&self, text: &NormalizedText) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        if let Some(word) = self.check(
            &text.normalize(Transform::MATCHING),
            &text.tokenize(Transform::MATCHING),
        ) {
            return Some(word);
        }

        let words = text.tokenize(&[Transform::StripInvisible, Transform::Lowercase]);
        let mut changed = false;
        let swapped: Vec<String> = words
            .iter()
            .map(|w| match swap_layout(w) {
                Some(other) => {
                    changed = true;
                    other
                }
                None => w.clone(),
            })
            .collect();
        if !changed {
            return None;
        }
        let swapped = NormalizedText::new(swapped.join(" "));
        self.check(
            &swapped.normalize(Transform::MATCHING),
            &swapped.tokenize(Transform::MATCHING),
        )
    }
}

/// Resolved restricted-word rule
#[derive(Debug, Clone, PartialEq)]
pub struct MwordRule {
    /// Offense counter surface
    pub name: String,
    pub punishments: Vec<Punishment>,
    pub reset_after: Duration,
    pub options: MwordOptions,
}

impl MwordRule {
    pub fn applies_to(&self, msg: &ChatMessage) -> bool {
        !(self.options.no_vip && msg.is_vip) && !(self.options.no_sub && msg.is_subscriber)
    }
}

#[derive(Debug, Default)]
pub struct MwordRules {
    /// Whole-word rules, matched on lowercased normalized tokens
    folded: PhraseMatcher<Arc<MwordRule>>,
    /// Case-insensitive contains/regex rules, matched with lookalikes folded
    folded_patterns: PhraseMatcher<Arc<MwordRule>>,
    /// Case-sensitive whole-word and contains/regex rules
    cased: PhraseMatcher<Arc<MwordRule>>,
}

impl MwordRules {
    pub fn build(config: &MwordsConfig) -> Result<Self, ConfigError> {
        if !config.enabled {
            return Ok(Self::default());
        }
        let mut groups: Vec<(String, MwordGroup)> = config
            .groups
            .iter()
            .map(|(name, group)| (format!("mword:{}", name), group.clone()))
            .collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        groups.extend(
            config
                .individual
                .iter()
                .map(|entry| (format!("mword:{}", entry.word), entry.as_group())),
        );

        let mut folded = Vec::new();
        let mut cased = Vec::new();
        let mut folded_patterns = Vec::new();
        let mut cased_patterns = Vec::new();
        for (name, group) in groups.into_iter().filter(|(_, g)| g.enabled) {
            let rule = Arc::new(MwordRule {
                name: name.clone(),
                punishments: group.punishments.clone(),
                reset_after: Duration::from_secs(group.reset_punishments_secs),
                options: group.options.clone(),
            });
            let sensitive = group.options.case_sensitive;
            for word in &group.words {
                if group.options.contains {
                    let escaped = regex::escape(word.trim());
                    if sensitive {
                        cased_patterns.push((format!("(?-i:{})", escaped), rule.clone()));
                    } else {
                        folded_patterns.push((escaped, rule.clone()));
                    }
                } else if sensitive {
                    cased.push((word.clone(), rule.clone()));
                } else {
                    folded.push((word.clone(), rule.clone()));
                }
            }
            for pattern in &group.regex {
                Regex::new(pattern).map_err(|e| invalid_regex(&name, pattern, e))?;
                if sensitive {
                    cased_patterns.push((format!("(?-i:{})", pattern), rule.clone()));
                } else {
                    folded_patterns.push((pattern.clone(), rule.clone()));
                }
            }
        }
        let alternation = |patterns: Vec<(String, Arc<MwordRule>)>| {
            CompiledAlternation::build(patterns)
                .map_err(|e| invalid_regex("mwords", "<combined>", e))
        };
        let rules = Self {
            folded: PhraseMatcher::build_with(folded, Transform::MATCHING),
            folded_patterns: PhraseMatcher::default()
                .with_alternation(alternation(folded_patterns)?),
            cased: PhraseMatcher::build_with(cased, CASED)
                .with_alternation(alternation(cased_patterns)?),
        };
        info!(
            "Compiled mwords: {} phrases, {} patterns",
            rules.folded.phrase_count() + rules.cased.phrase_count(),
            rules.folded_patterns.pattern_count() + rules.cased.pattern_count()
        );
        Ok(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.folded.is_empty() && self.folded_patterns.is_empty() && self.cased.is_empty()
    }

    /// First rule (longest phrase first) that matches and applies to the sender
    pub fn find(&self, msg: &ChatMessage, text: &NormalizedText) -> Option<Arc<MwordRule>> {
        if self.is_empty() {
            return None;
        }
        let accept = |rule: &Arc<MwordRule>| rule.applies_to(msg);
        let folded_text = text.normalize(Transform::MATCHING);
        if let Some(found) =
            self.folded
                .find_where(&folded_text, &text.tokenize(Transform::MATCHING), accept)
        {
            return Some(found.value.clone());
        }
        let no_tokens: &[&str] = &[];
        if let Some(found) =
            self.folded_patterns
                .find_where(&text.normalize(FOLDED), no_tokens, accept)
        {
            return Some(found.value.clone());
        }
        self.cased
            .find_where(&text.normalize(RAW), &text.tokenize(CASED), accept)
            .map(|found| found.value.clone())
    }
}

#[derive(Debug)]
enum ExceptionPattern {
    Literal(String),
    Regex(Regex),
}

/// Compiled exception: a repetition that is tolerated up to its own limit
#[derive(Debug)]
pub struct Exception {
    pub name: String,
    pattern: ExceptionPattern,
    pub message_limit: usize,
    pub punishments: Vec<Punishment>,
    pub reset_after: Duration,
    pub options: ExceptionOptions,
}

impl Exception {
    fn compile(section: &str, rule: &ExceptionRule) -> Result<Self, ConfigError> {
        let options = rule.options.clone();
        let pattern = if rule.regex {
            let source = if options.contains {
                rule.pattern.clone()
            } else {
                format!("^(?:{})$", rule.pattern)
            };
            let regex = RegexBuilder::new(&source)
                .case_insensitive(!options.case_sensitive)
                .build()
                .map_err(|e| invalid_regex(section, &rule.pattern, e))?;
            ExceptionPattern::Regex(regex)
        } else {
            let transforms = if options.case_sensitive {
                CASED
            } else {
                Transform::MATCHING
            };
            let literal = normalize(&rule.pattern, transforms);
            ExceptionPattern::Literal(literal.split_whitespace().collect::<Vec<_>>().join(" "))
        };
        Ok(Self {
            name: format!("exception:{}", rule.pattern),
            pattern,
            message_limit: rule.message_limit,
            punishments: rule.punishments.clone(),
            reset_after: Duration::from_secs(rule.reset_punishments_secs),
            options,
        })
    }

    pub fn matches(&self, msg: &ChatMessage, text: &NormalizedText) -> bool {
        let options = &self.options;
        if (options.no_vip && msg.is_vip) || (options.no_sub && msg.is_subscriber) {
            return false;
        }
        let transforms = if options.case_sensitive {
            CASED
        } else {
            Transform::MATCHING
        };
        let tokens = text.tokenize(transforms);
        if tokens.is_empty() || (options.one_word && tokens.len() != 1) {
            return false;
        }
        if options.no_repeat {
            let mut seen = HashSet::new();
            if !tokens.iter().all(|t| seen.insert(t.as_str())) {
                return false;
            }
        }
        match &self.pattern {
            ExceptionPattern::Literal(literal) => {
                let joined = tokens.join(" ");
                if options.contains {
                    joined.contains(literal.as_str())
                } else {
                    joined == *literal
                }
            }
            ExceptionPattern::Regex(regex) => regex.is_match(text.normalize(RAW).trim()),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExceptionSet {
    rules: Vec<Exception>,
}

impl ExceptionSet {
    pub fn build(section: &str, rules: &[ExceptionRule]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.enabled)
            .map(|(i, rule)| Exception::compile(&format!("{}[{}]", section, i), rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First exception, in configuration order, that covers the message
    pub fn find(&self, msg: &ChatMessage, text: &NormalizedText) -> Option<&Exception> {
        self.rules.iter().find(|rule| rule.matches(msg, text))
    }
}

/// Every compiled rule the detector consults, rebuilt and swapped as one unit
#[derive(Debug, Default)]
pub struct RuleSet {
    pub banwords: BanwordRules,
    pub mwords: MwordRules,
    pub exceptions: ExceptionSet,
    pub emote_exceptions: ExceptionSet,
}

impl RuleSet {
    pub fn build(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            banwords: BanwordRules::build(&config.banwords),
            mwords: MwordRules::build(&config.mwords)?,
            exceptions: ExceptionSet::build("exceptions", &config.exceptions)?,
            emote_exceptions: ExceptionSet::build("emote_exceptions", &config.emote_exceptions)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MwordEntry;
    use std::collections::HashMap;

    fn text(s: &str) -> NormalizedText {
        NormalizedText::new(s)
    }

    fn msg(content: &str) -> ChatMessage {
        ChatMessage::new("1", "streamer", "viewer", content)
    }

    fn banwords(exact: &[&str], substring: &[&str]) -> BanwordRules {
        BanwordRules::build(&BanwordsConfig {
            enabled: true,
            exact: exact.iter().map(|s| s.to_string()).collect(),
            substring: substring.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_banword_exact_and_substring() {
        let rules = banwords(&["bad word"], &["пидор"]);
        assert_eq!(rules.find(&text("such a BAD, word")).as_deref(), Some("bad word"));
        assert!(rules.find(&text("badword")).is_none());
        assert_eq!(rules.find(&text("ты пидорас")).as_deref(), Some("пидор"));
        assert_eq!(rules.find(&text("п и д о р")).as_deref(), Some("пидор"));
        assert!(rules.find(&text("hello chat")).is_none());
    }

    #[test]
    fn test_banword_keyboard_layout() {
        let rules = banwords(&[], &["пидор"]);
        assert_eq!(rules.find(&text("ну ты gbljh")).as_deref(), Some("пидор"));

        let rules = banwords(&["noob"], &[]);
        assert_eq!(rules.find(&text("тщщи")).as_deref(), Some("noob"));
    }

    #[test]
    fn test_banword_homoglyphs_and_invisible() {
        let rules = banwords(&["spam"], &[]);
        // Cyrillic 'а' inside a Latin word, zero-width space in the middle
        assert!(rules.find(&text("sp\u{200B}\u{0430}m")).is_some());
    }

    #[test]
    fn test_disabled_banwords_never_match() {
        let rules = BanwordRules::build(&BanwordsConfig {
            enabled: false,
            exact: vec!["spam".to_string()],
            substring: Vec::new(),
        });
        assert!(rules.find(&text("spam")).is_none());
    }

    fn mwords(groups: Vec<(&str, MwordGroup)>, individual: Vec<MwordEntry>) -> MwordRules {
        MwordRules::build(&MwordsConfig {
            enabled: true,
            individual,
            groups: groups
                .into_iter()
                .map(|(name, g)| (name.to_string(), g))
                .collect::<HashMap<_, _>>(),
        })
        .unwrap()
    }

    #[test]
    fn test_mword_whole_word_vs_contains() {
        let rules = mwords(
            vec![
                (
                    "words",
                    MwordGroup {
                        words: vec!["cheap".to_string()],
                        ..MwordGroup::default()
                    },
                ),
                (
                    "inside",
                    MwordGroup {
                        words: vec!["coin".to_string()],
                        options: MwordOptions {
                            contains: true,
                            ..MwordOptions::default()
                        },
                        ..MwordGroup::default()
                    },
                ),
            ],
            Vec::new(),
        );
        let m = msg("");
        assert_eq!(rules.find(&m, &text("so CHEAP!")).unwrap().name, "mword:words");
        assert!(rules.find(&m, &text("cheaper")).is_none());
        assert_eq!(rules.find(&m, &text("bitcoins")).unwrap().name, "mword:inside");
    }

    #[test]
    fn test_mword_patterns_see_through_homoglyphs() {
        let rules = mwords(
            vec![(
                "inside",
                MwordGroup {
                    words: vec!["coin".to_string()],
                    options: MwordOptions {
                        contains: true,
                        ..MwordOptions::default()
                    },
                    ..MwordGroup::default()
                },
            )],
            vec![MwordEntry {
                word: r"free\s+nitro".to_string(),
                regex: true,
                ..MwordEntry::default()
            }],
        );
        let m = msg("");
        // Cyrillic 'с' and 'о'
        assert_eq!(rules.find(&m, &text("bit\u{0441}\u{043E}ins")).unwrap().name, "mword:inside");
        assert_eq!(
            rules.find(&m, &text("FR\u{0415}E nitro")).unwrap().name,
            r"mword:free\s+nitro"
        );
    }

    #[test]
    fn test_mword_case_sensitive_and_audience() {
        let rules = mwords(
            Vec::new(),
            vec![
                MwordEntry {
                    word: "KEKW".to_string(),
                    options: MwordOptions {
                        case_sensitive: true,
                        no_sub: true,
                        ..MwordOptions::default()
                    },
                    ..MwordEntry::default()
                },
                MwordEntry {
                    word: r"bit\.ly/\w+".to_string(),
                    regex: true,
                    ..MwordEntry::default()
                },
            ],
        );
        let mut m = msg("");
        assert!(rules.find(&m, &text("KEKW")).is_some());
        assert!(rules.find(&m, &text("kekw")).is_none());
        assert_eq!(
            rules.find(&m, &text("see BIT.LY/xyz")).unwrap().name,
            r"mword:bit\.ly/\w+"
        );

        m.is_subscriber = true;
        assert!(rules.find(&m, &text("KEKW")).is_none());
    }

    #[test]
    fn test_exception_options() {
        let compile = |pattern: &str, options: ExceptionOptions| {
            Exception::compile(
                "test",
                &ExceptionRule {
                    pattern: pattern.to_string(),
                    options,
                    ..ExceptionRule::default()
                },
            )
            .unwrap()
        };
        let m = msg("");

        let exact = compile("gg", ExceptionOptions::default());
        assert!(exact.matches(&m, &text("GG!")));
        assert!(!exact.matches(&m, &text("gg wp")));

        let contains = compile(
            "gg",
            ExceptionOptions {
                contains: true,
                ..ExceptionOptions::default()
            },
        );
        assert!(contains.matches(&m, &text("gg wp")));

        let one_word = compile(
            "gg",
            ExceptionOptions {
                contains: true,
                one_word: true,
                ..ExceptionOptions::default()
            },
        );
        assert!(!one_word.matches(&m, &text("gg wp")));

        let no_repeat = compile(
            "gg",
            ExceptionOptions {
                contains: true,
                no_repeat: true,
                ..ExceptionOptions::default()
            },
        );
        assert!(!no_repeat.matches(&m, &text("gg gg gg")));

        let mut vip = msg("");
        vip.is_vip = true;
        let no_vip = compile(
            "gg",
            ExceptionOptions {
                no_vip: true,
                ..ExceptionOptions::default()
            },
        );
        assert!(!no_vip.matches(&vip, &text("gg")));
        assert!(no_vip.matches(&m, &text("gg")));
    }

    #[test]
    fn test_regex_exception_anchored_unless_contains() {
        let rule = ExceptionRule {
            pattern: r"[0-9]+".to_string(),
            regex: true,
            ..ExceptionRule::default()
        };
        let anchored = Exception::compile("test", &rule).unwrap();
        assert!(anchored.matches(&msg(""), &text("1234")));
        assert!(!anchored.matches(&msg(""), &text("bet 1234")));

        let bad = ExceptionRule {
            pattern: "(".to_string(),
            regex: true,
            ..ExceptionRule::default()
        };
        assert!(ExceptionSet::build("exceptions", &[bad]).is_err());
    }
}
