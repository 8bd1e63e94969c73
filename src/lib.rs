//! # Chatwarden
//!
//! Real-time chat moderation core for streaming platforms.
//!
//! ## Features
//!
//! - **Similarity Spam Detection**: per-user message windows scored by word-set overlap
//! - **Phrase Matching**: banwords, moderated words and exceptions over a token trie plus regex alternation
//! - **Evasion Resistant**: homoglyph folding, invisible character stripping, keyboard-layout swaps
//! - **Punishment Escalation**: per-surface offense ladders that reset after a quiet period
//! - **Trust Scopes**: role and user bitmasks for bypasses and admin permissions
//! - **Timing Wheel**: one tick driver for every expiry in the process
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatwarden::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_path("chatwarden.yaml").await?;
//!     let stream = Arc::new(ManualStream::new(true, None));
//!     let detector = SpamDetector::new(config, stream)?;
//!
//!     let mut driver = WheelDriver::new(Duration::from_millis(100));
//!     detector.register(&mut driver);
//!     let timers = driver.spawn();
//!
//!     let msg = ChatMessage::new("1", "somechannel", "viewer", "hello chat");
//!     let action = detector.check(&msg);
//!     println!("{:?}", action.kind);
//!
//!     timers.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod matcher;
pub mod store;
pub mod text;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::nuke::NukeRule;
    pub use crate::bot::trust::{Scope, ScopeMask, TrustResolver, TrustTable};
    pub use crate::bot::{ManualStream, SpamDetector, StreamState};
    pub use crate::config::{ConfigError, ConfigHandle, EngineConfig};
    pub use crate::store::{StoreOptions, TimingWheel, TtlStore, WheelDriver};
    pub use crate::text::{NormalizedText, Transform};
    pub use crate::types::{Action, ActionKind, ChatMessage, Punishment};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
