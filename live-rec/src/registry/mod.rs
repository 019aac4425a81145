//! Target registry: the live mapping of target name to media URL(s).
//!
//! The registry is written by whatever resolves live targets (see
//! [`FileTargetSource`]) and only read by the dispatcher.

mod source;

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use source::{FileTargetSource, spawn_refresh};

/// A recordable target and where its stream can currently be pulled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Unique target name.
    pub name: String,
    /// Media URL for the primary protocol.
    pub primary_url: String,
    /// Media URL for the secondary protocol, if the resolver found one.
    pub secondary_url: Option<String>,
}

impl Target {
    pub fn new(name: impl Into<String>, primary_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_url: primary_url.into(),
            secondary_url: None,
        }
    }

    pub fn with_secondary(mut self, url: impl Into<String>) -> Self {
        self.secondary_url = Some(url.into());
        self
    }
}

/// Counts describing what a [`TargetRegistry::replace_all`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.updated == 0
    }
}

/// Concurrent map of current targets.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: DashMap<String, Target>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a target. Returns `true` if anything changed.
    pub fn upsert(&self, target: Target) -> bool {
        match self.targets.insert(target.name.clone(), target.clone()) {
            Some(previous) => previous != target,
            None => true,
        }
    }

    pub fn remove(&self, name: &str) -> Option<Target> {
        self.targets.remove(name).map(|(_, target)| target)
    }

    /// Make the registry contain exactly `targets`.
    pub fn replace_all(&self, targets: impl IntoIterator<Item = Target>) -> RegistryDiff {
        let mut diff = RegistryDiff::default();
        let mut seen = HashSet::new();

        for target in targets {
            seen.insert(target.name.clone());
            match self.targets.insert(target.name.clone(), target.clone()) {
                None => diff.added += 1,
                Some(previous) if previous != target => diff.updated += 1,
                Some(_) => {}
            }
        }

        self.targets.retain(|name, _| {
            let keep = seen.contains(name);
            if !keep {
                diff.removed += 1;
            }
            keep
        });

        if !diff.is_empty() {
            debug!(
                added = diff.added,
                removed = diff.removed,
                updated = diff.updated,
                "Target registry updated"
            );
        }
        diff
    }

    pub fn get(&self, name: &str) -> Option<Target> {
        self.targets.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    /// All current targets, ordered by name.
    pub fn snapshot(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self
            .targets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
