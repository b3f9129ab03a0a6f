//! Within-run duplicate suppression.
//!
//! The tracker maps each entity definition to the set of entity ids seen so
//! far in the current sync job. It is the only shared mutable state in the
//! pipeline: several batches may be in flight at once, so every
//! check-and-insert happens under one mutex. Logging and counters stay
//! outside the critical section.
//!
//! The tracker doubles as the record of everything encountered during the
//! run, which the orphan sweep diffs against the metadata store.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::models::{Entity, EntityKey};

/// Entities that survived the filter plus the dropped duplicates.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub unique: Vec<Entity>,
    pub duplicates: Vec<Entity>,
}

impl DedupOutcome {
    pub fn skipped(&self) -> u64 {
        self.duplicates.len() as u64
    }
}

#[derive(Default)]
pub struct Deduplicator {
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entities whose id was already seen for the same definition.
    pub fn filter(&self, entities: Vec<Entity>) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();

        for entity in entities {
            let first_sighting = {
                let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
                let ids = seen.entry(entity.definition_id().to_string()).or_default();
                ids.insert(entity.entity_id.clone())
            };
            if first_sighting {
                outcome.unique.push(entity);
            } else {
                outcome.duplicates.push(entity);
            }
        }

        if !outcome.duplicates.is_empty() {
            let ids: Vec<&str> = outcome.duplicates.iter().map(|e| e.entity_id.as_str()).collect();
            tracing::debug!(count = ids.len(), ids = ?ids, "dropped duplicate entities");
        }
        outcome
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let found = seen
            .get(&key.entity_definition_id)
            .is_some_and(|ids| ids.contains(&key.entity_id));
        found
    }

    /// Snapshot of every key encountered so far.
    pub fn encountered(&self) -> HashSet<EntityKey> {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let keys = seen
            .iter()
            .flat_map(|(definition, ids)| ids.iter().map(move |id| EntityKey::new(id, definition)))
            .collect();
        keys
    }

    pub fn len(&self) -> usize {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let total = seen.values().map(HashSet::len).sum();
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
