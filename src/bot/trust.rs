// src/bot/trust.rs - Role/user capability bitmasks with eager recomputation

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use std::sync::RwLock;

use crate::config::TrustConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    IgnoreAntispam,
    IgnoreMword,
    IgnoreBanwords,
    IgnoreAds,
    ModActions,
    Nuke,
    Polls,
    Predictions,
    Config,
    Trust,
}

impl Scope {
    /// Bit order
    pub const ALL: [Scope; 10] = [
        Scope::IgnoreAntispam,
        Scope::IgnoreMword,
        Scope::IgnoreBanwords,
        Scope::IgnoreAds,
        Scope::ModActions,
        Scope::Nuke,
        Scope::Polls,
        Scope::Predictions,
        Scope::Config,
        Scope::Trust,
    ];

    pub fn bit(self) -> u64 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Scope::IgnoreAntispam => "ignore-antispam",
            Scope::IgnoreMword => "ignore-mword",
            Scope::IgnoreBanwords => "ignore-banwords",
            Scope::IgnoreAds => "ignore-ads",
            Scope::ModActions => "mod-actions",
            Scope::Nuke => "nuke",
            Scope::Polls => "polls",
            Scope::Predictions => "predictions",
            Scope::Config => "config",
            Scope::Trust => "trust",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown trust scope '{0}'")]
pub struct UnknownScope(pub String);

impl FromStr for Scope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        Scope::ALL
            .into_iter()
            .find(|scope| scope.name() == wanted)
            .ok_or_else(|| UnknownScope(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ScopeMask(u64);

impl ScopeMask {
    pub const EMPTY: ScopeMask = ScopeMask(0);

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, scope: Scope) -> bool {
        self.0 & scope.bit() != 0
    }

    pub fn intersects(self, other: ScopeMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: ScopeMask) -> ScopeMask {
        ScopeMask(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn scopes(self) -> impl Iterator<Item = Scope> {
        Scope::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl From<Scope> for ScopeMask {
    fn from(scope: Scope) -> Self {
        ScopeMask(scope.bit())
    }
}

impl FromIterator<Scope> for ScopeMask {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        ScopeMask(iter.into_iter().fold(0, |acc, s| acc | s.bit()))
    }
}

impl<'a> FromIterator<&'a Scope> for ScopeMask {
    fn from_iter<I: IntoIterator<Item = &'a Scope>>(iter: I) -> Self {
        iter.into_iter().copied().collect()
    }
}

impl BitOr for ScopeMask {
    type Output = ScopeMask;

    fn bitor(self, rhs: ScopeMask) -> ScopeMask {
        ScopeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ScopeMask {
    fn bitor_assign(&mut self, rhs: ScopeMask) {
        self.0 |= rhs.0;
    }
}

/// Capability lookups the detector needs
pub trait TrustResolver: Send + Sync {
    fn mask(&self, user: &str) -> ScopeMask;

    fn has_scope(&self, user: &str, scope: Scope) -> bool {
        self.mask(user).contains(scope)
    }

    fn has_any_scope(&self, user: &str, scopes: &[Scope]) -> bool {
        self.mask(user).intersects(scopes.iter().collect())
    }
}

#[derive(Debug, Clone, Default)]
struct UserRecord {
    roles: BTreeSet<String>,
    scopes: ScopeMask,
    /// Role masks OR direct scopes, kept current by every mutation
    effective: ScopeMask,
}

#[derive(Debug, Default)]
struct TrustState {
    roles: HashMap<String, ScopeMask>,
    users: HashMap<String, UserRecord>,
}

impl TrustState {
    fn effective(&self, record: &UserRecord) -> ScopeMask {
        record
            .roles
            .iter()
            .filter_map(|role| self.roles.get(role))
            .fold(record.scopes, |acc, mask| acc | *mask)
    }

    fn recompute_all(&mut self) {
        let masks: Vec<(String, ScopeMask)> = self
            .users
            .iter()
            .map(|(user, record)| (user.clone(), self.effective(record)))
            .collect();
        for (user, mask) in masks {
            if let Some(record) = self.users.get_mut(&user) {
                record.effective = mask;
            }
        }
    }

    fn recompute(&mut self, user: &str) {
        let Some(record) = self.users.get(user) else {
            return;
        };
        let mask = self.effective(record);
        if let Some(record) = self.users.get_mut(user) {
            record.effective = mask;
        }
    }
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Role and user trust records behind one lock. Reads are a single map lookup.
#[derive(Debug, Default)]
pub struct TrustTable {
    state: RwLock<TrustState>,
}

impl TrustTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &TrustConfig) -> Self {
        let table = Self::new();
        table.load(config);
        table
    }

    /// Replace every role and user with the configured ones
    pub fn load(&self, config: &TrustConfig) {
        let mut state = TrustState {
            roles: config
                .roles
                .iter()
                .map(|(role, scopes)| (key(role), scopes.iter().collect()))
                .filter(|(_, mask): &(String, ScopeMask)| !mask.is_empty())
                .collect(),
            users: config
                .users
                .iter()
                .map(|(user, entry)| {
                    let record = UserRecord {
                        roles: entry.roles.iter().map(|r| key(r)).collect(),
                        scopes: entry.scopes.iter().collect(),
                        effective: ScopeMask::EMPTY,
                    };
                    (key(user), record)
                })
                .filter(|(_, record)| !record.roles.is_empty() || !record.scopes.is_empty())
                .collect(),
        };
        state.recompute_all();
        info!(
            "Loaded trust table: {} roles, {} users",
            state.roles.len(),
            state.users.len()
        );
        *self.write() = state;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrustState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrustState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Scope names held by `user`, in bit order
    pub fn get_scopes(&self, user: &str) -> Vec<String> {
        self.mask(user).scopes().map(|s| s.name().to_string()).collect()
    }

    pub fn user_roles(&self, user: &str) -> Vec<String> {
        self.read()
            .users
            .get(&key(user))
            .map(|record| record.roles.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn role_scopes(&self, role: &str) -> Option<ScopeMask> {
        self.read().roles.get(&key(role)).copied()
    }

    pub fn user_count(&self) -> usize {
        self.read().users.len()
    }

    pub fn role_count(&self) -> usize {
        self.read().roles.len()
    }

    /// Grant roles and direct scopes to `user`, creating the record if needed
    pub fn update(&self, user: &str, roles: &[&str], scopes: &[Scope]) {
        if roles.is_empty() && scopes.is_empty() {
            return;
        }
        let user = key(user);
        let mut state = self.write();
        let record = state.users.entry(user.clone()).or_default();
        record.roles.extend(roles.iter().map(|r| key(r)));
        record.scopes |= scopes.iter().collect();
        state.recompute(&user);
        debug!("Updated trust for {}", user);
    }

    /// Take roles and direct scopes away; a user left with neither is dropped
    pub fn remove_from_user(&self, user: &str, roles: &[&str], scopes: &[Scope]) {
        let user = key(user);
        let mut state = self.write();
        let Some(record) = state.users.get_mut(&user) else {
            return;
        };
        for role in roles {
            record.roles.remove(&key(role));
        }
        record.scopes = record.scopes.without(scopes.iter().collect());
        if record.roles.is_empty() && record.scopes.is_empty() {
            state.users.remove(&user);
            debug!("Removed trust record for {}", user);
            return;
        }
        state.recompute(&user);
    }

    pub fn remove_user(&self, user: &str) -> bool {
        self.write().users.remove(&key(user)).is_some()
    }

    /// OR `scopes` into `role` and recompute every user
    pub fn add_role(&self, role: &str, scopes: &[Scope]) {
        let mut state = self.write();
        let mask: ScopeMask = scopes.iter().collect();
        if mask.is_empty() {
            return;
        }
        *state.roles.entry(key(role)).or_default() |= mask;
        state.recompute_all();
        info!("Role '{}' now grants {:?}", key(role), state.roles.get(&key(role)));
    }

    /// Remove `scopes` from `role`, or the whole role when `None`. A role left
    /// with no scopes is deleted; users keep referencing it and get nothing from it.
    pub fn delete_role(&self, role: &str, scopes: Option<&[Scope]>) -> bool {
        let role = key(role);
        let mut state = self.write();
        let Some(current) = state.roles.get(&role).copied() else {
            return false;
        };
        let remaining = match scopes {
            Some(scopes) => current.without(scopes.iter().collect()),
            None => ScopeMask::EMPTY,
        };
        if remaining.is_empty() {
            state.roles.remove(&role);
            info!("Deleted role '{}'", role);
        } else {
            state.roles.insert(role, remaining);
        }
        state.recompute_all();
        true
    }
}

impl TrustResolver for TrustTable {
    fn mask(&self, user: &str) -> ScopeMask {
        self.read()
            .users
            .get(&key(user))
            .map_or(ScopeMask::EMPTY, |record| record.effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrustUserConfig;

    #[test]
    fn test_role_mutation_recomputes_users() {
        let trust = TrustTable::new();
        trust.add_role("mod", &[Scope::ModActions]);
        trust.update("u1", &["mod"], &[]);
        assert!(trust.has_scope("u1", Scope::ModActions));

        trust.delete_role("mod", None);
        assert!(!trust.has_scope("u1", Scope::ModActions));
        assert_eq!(trust.user_roles("u1"), vec!["mod".to_string()]);

        // re-creating the role flows back into the existing reference
        trust.add_role("mod", &[Scope::Nuke]);
        assert!(trust.has_scope("u1", Scope::Nuke));
    }

    #[test]
    fn test_effective_mask_is_union() {
        let trust = TrustTable::new();
        trust.add_role("helper", &[Scope::IgnoreAntispam, Scope::IgnoreAds]);
        trust.add_role("pollster", &[Scope::Polls]);
        trust.update("Viewer", &["helper", "pollster", "ghost"], &[Scope::Predictions]);

        assert_eq!(
            trust.get_scopes("viewer"),
            vec!["ignore-antispam", "ignore-ads", "polls", "predictions"]
        );
        assert!(trust.has_any_scope("viewer", &[Scope::Nuke, Scope::Polls]));
        assert!(!trust.has_any_scope("viewer", &[Scope::Nuke, Scope::Config]));
        assert!(!trust.has_scope("stranger", Scope::Polls));
    }

    #[test]
    fn test_partial_role_delete() {
        let trust = TrustTable::new();
        trust.add_role("mod", &[Scope::ModActions, Scope::Nuke]);
        trust.update("u1", &["mod"], &[]);
        assert!(trust.delete_role("mod", Some(&[Scope::Nuke])));
        assert!(trust.has_scope("u1", Scope::ModActions));
        assert!(!trust.has_scope("u1", Scope::Nuke));

        trust.delete_role("mod", Some(&[Scope::ModActions]));
        assert_eq!(trust.role_count(), 0);
        assert!(!trust.delete_role("mod", None));
    }

    #[test]
    fn test_last_role_and_scope_removes_user() {
        let trust = TrustTable::new();
        trust.add_role("vip", &[Scope::IgnoreMword]);
        trust.update("u1", &["vip"], &[Scope::Polls]);
        trust.remove_from_user("u1", &["vip"], &[]);
        assert_eq!(trust.user_count(), 1);
        assert_eq!(trust.get_scopes("u1"), vec!["polls"]);

        trust.remove_from_user("u1", &[], &[Scope::Polls]);
        assert_eq!(trust.user_count(), 0);
    }

    #[test]
    fn test_scope_names_round_trip() {
        for scope in Scope::ALL {
            assert_eq!(scope.name().parse::<Scope>().unwrap(), scope);
        }
        assert_eq!("IGNORE_ANTISPAM".parse::<Scope>().unwrap(), Scope::IgnoreAntispam);
        assert!("fly".parse::<Scope>().is_err());
        let parsed: Vec<Scope> = serde_json::from_str(r#"["mod-actions","nuke"]"#).unwrap();
        assert_eq!(parsed, vec![Scope::ModActions, Scope::Nuke]);
    }

    #[test]
    fn test_load_from_config() {
        let mut config = TrustConfig::default();
        config.roles.insert("mod".to_string(), vec![Scope::ModActions]);
        config.users.insert(
            "Someone".to_string(),
            TrustUserConfig {
                roles: vec!["mod".to_string()],
                scopes: vec![Scope::IgnoreAntispam],
            },
        );
        let trust = TrustTable::from_config(&config);
        assert!(trust.has_scope("someone", Scope::ModActions));
        assert!(trust.has_scope("someone", Scope::IgnoreAntispam));
    }
}
