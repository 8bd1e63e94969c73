// src/types/mod.rs - Message, decision and punishment types shared by the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Inbound chat message as handed over by a platform adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    /// Login of the channel owner (the broadcaster)
    pub channel: String,
    /// Login of the chatter
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub content: String,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub is_broadcaster: bool,
    #[serde(default)]
    pub is_mod: bool,
    #[serde(default)]
    pub is_vip: bool,
    #[serde(default)]
    pub is_subscriber: bool,
    #[serde(default)]
    pub emote_only: bool,
    #[serde(default)]
    pub emotes: Vec<String>,
    #[serde(default)]
    pub reply_parent: Option<ReplyParent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyParent {
    pub message_id: String,
    pub user_login: String,
    #[serde(default)]
    pub body: String,
}

impl ChatMessage {
    pub fn new(
        message_id: impl Into<String>,
        channel: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            channel: channel.into(),
            username: username.into(),
            display_name: None,
            content: content.into(),
            timestamp: chrono::Utc::now(),
            is_broadcaster: false,
            is_mod: false,
            is_vip: false,
            is_subscriber: false,
            emote_only: false,
            emotes: Vec::new(),
            reply_parent: None,
        }
    }

    /// Message text with a leading `@parent` reply mention removed
    pub fn body(&self) -> &str {
        let Some(parent) = &self.reply_parent else {
            return &self.content;
        };
        let text = self.content.trim_start();
        let Some(rest) = text.strip_prefix('@') else {
            return &self.content;
        };
        let login = parent.user_login.as_str();
        match rest.get(..login.len()) {
            Some(head) if head.eq_ignore_ascii_case(login) => {
                let tail = &rest[login.len()..];
                if tail.is_empty() || tail.starts_with(char::is_whitespace) {
                    tail.trim_start()
                } else {
                    &self.content
                }
            }
            _ => &self.content,
        }
    }
}

/// One step of a punishment ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Punishment {
    Delete,
    Warn,
    Timeout(Duration),
    Ban,
    /// Copy the default tier's ladder; resolved when configuration is merged
    Inherit,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid punishment '{0}', expected delete | warn | timeout:<seconds> | ban | inherit")]
pub struct PunishmentParseError(pub String);

impl FromStr for Punishment {
    type Err = PunishmentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "delete" => Ok(Punishment::Delete),
            "warn" => Ok(Punishment::Warn),
            "ban" => Ok(Punishment::Ban),
            "inherit" => Ok(Punishment::Inherit),
            other => {
                let secs = other
                    .strip_prefix("timeout:")
                    .or_else(|| other.strip_prefix("timeout "))
                    .ok_or_else(|| PunishmentParseError(s.to_string()))?;
                let secs: u64 = secs
                    .trim()
                    .parse()
                    .map_err(|_| PunishmentParseError(s.to_string()))?;
                Ok(Punishment::Timeout(Duration::from_secs(secs)))
            }
        }
    }
}

impl TryFrom<String> for Punishment {
    type Error = PunishmentParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Punishment> for String {
    fn from(value: Punishment) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Punishment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Punishment::Delete => f.write_str("delete"),
            Punishment::Warn => f.write_str("warn"),
            Punishment::Timeout(d) => write!(f, "timeout:{}", d.as_secs()),
            Punishment::Ban => f.write_str("ban"),
            Punishment::Inherit => f.write_str("inherit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    None,
    Delete,
    Warn,
    Timeout,
    Ban,
}

/// Decision returned for every checked message; callers execute it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub reason: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl Action {
    pub fn none() -> Self {
        Self {
            kind: ActionKind::None,
            reason: String::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn ban(reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Ban,
            reason: reason.into(),
            duration: Duration::ZERO,
        }
    }

    /// Turn a resolved ladder step into a decision
    pub fn from_punishment(punishment: Punishment, reason: impl Into<String>) -> Self {
        let (kind, duration) = match punishment {
            Punishment::Delete => (ActionKind::Delete, Duration::ZERO),
            Punishment::Warn => (ActionKind::Warn, Duration::ZERO),
            Punishment::Timeout(d) => (ActionKind::Timeout, d),
            Punishment::Ban => (ActionKind::Ban, Duration::ZERO),
            // Never present after merge; treat as the mildest step
            Punishment::Inherit => (ActionKind::Delete, Duration::ZERO),
        };
        Self {
            kind,
            reason: reason.into(),
            duration,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == ActionKind::None
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
