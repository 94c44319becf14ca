//! Rendezvous tokens: `(experiment, role, reset) -> port`
//!
//! Creating a token for reset `N` purges every older reset of the same
//! experiment and role, so a stale reset can never be resolved. Tokens
//! also expire after a fixed shelf life.

use super::error::GatewayError;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Identifies one participant of one reset of one experiment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    /// Experiment id
    pub experiment_id: String,
    /// Participant role
    pub role: usize,
    /// Reset counter
    pub reset: u64,
}

impl TokenKey {
    /// Build a key
    pub fn new(experiment_id: impl Into<String>, role: usize, reset: u64) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            role,
            reset,
        }
    }

    /// The same participant at the previous reset, if there is one
    pub fn previous(&self) -> Option<TokenKey> {
        self.reset
            .checked_sub(1)
            .map(|reset| TokenKey::new(self.experiment_id.clone(), self.role, reset))
    }

    /// The same reset for another role
    pub fn with_role(&self, role: usize) -> TokenKey {
        TokenKey::new(self.experiment_id.clone(), role, self.reset)
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.experiment_id, self.role, self.reset)
    }
}

impl FromStr for TokenKey {
    type Err = GatewayError;

    /// Parse `experiment:role:reset`; the experiment id may itself contain `:`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || GatewayError::BadToken(s.to_string());
        let mut parts = s.trim().rsplitn(3, ':');
        let reset = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let role = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let experiment_id = parts.next().filter(|e| !e.is_empty()).ok_or_else(bad)?;
        Ok(TokenKey::new(experiment_id, role, reset))
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenEntry {
    port: u16,
    created: Instant,
}

/// Table of live rendezvous tokens
#[derive(Debug)]
pub struct TokenTable {
    shelf_life: Duration,
    entries: HashMap<TokenKey, TokenEntry>,
}

impl TokenTable {
    /// Empty table whose tokens live for `shelf_life`
    pub fn new(shelf_life: Duration) -> Self {
        Self {
            shelf_life,
            entries: HashMap::new(),
        }
    }

    /// Drop every token
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Publish `key -> port`, purging older resets of the same participant
    pub fn insert(&mut self, key: TokenKey, port: u16) {
        self.entries.retain(|existing, _| {
            existing.experiment_id != key.experiment_id
                || existing.role != key.role
                || existing.reset >= key.reset
        });
        tracing::debug!("Token {} -> {}", key, port);
        self.entries.insert(
            key,
            TokenEntry {
                port,
                created: Instant::now(),
            },
        );
    }

    /// Remove a token; returns whether it was live
    pub fn remove(&mut self, key: &TokenKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove the previous reset's token for the same participant
    pub fn purge_previous(&mut self, key: &TokenKey) -> bool {
        match key.previous() {
            Some(previous) => self.remove(&previous),
            None => false,
        }
    }

    /// Port for a live, unexpired token
    pub fn lookup(&self, key: &TokenKey) -> Option<u16> {
        self.entries
            .get(key)
            .filter(|entry| entry.created.elapsed() <= self.shelf_life)
            .map(|entry| entry.port)
    }

    /// Whether a live, unexpired token exists
    pub fn contains(&self, key: &TokenKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Drop expired tokens; returns how many were dropped
    pub fn purge_expired(&mut self) -> usize {
        let before = self.entries.len();
        let shelf_life = self.shelf_life;
        self.entries
            .retain(|_, entry| entry.created.elapsed() <= shelf_life);
        before - self.entries.len()
    }

    /// Number of stored tokens, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
