use std::collections::{BTreeSet, HashMap};
use tokio::time::{Duration, Instant};

use crate::modality::{AnalysisResult, Modality};

/// An analysis waiting to contribute to a fusion pass
#[derive(Debug, Clone)]
pub struct PendingAnalysis {
    pub result: AnalysisResult,
    pub inserted_at: Instant,
    /// Insertion sequence number, for arrival-order tie breaks
    pub arrival: u64,
}

/// Short-term cache of recent analyses keyed by id
///
/// Holds at most `capacity` entries. When full, the oldest entry of the most
/// represented modality is evicted so one flooding modality cannot crowd
/// out the others.
#[derive(Debug)]
pub struct PendingCache {
    entries: HashMap<String, PendingAnalysis>,
    capacity: usize,
    next_arrival: u64,
}

impl PendingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            next_arrival: 0,
        }
    }

    /// Insert `result`. Returns false for an id already cached.
    pub fn insert(&mut self, result: AnalysisResult, now: Instant) -> bool {
        if self.entries.contains_key(&result.id) {
            return false;
        }

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.entries.insert(
            result.id.clone(),
            PendingAnalysis {
                result,
                inserted_at: now,
                arrival,
            },
        );

        while self.entries.len() > self.capacity {
            if !self.evict_one() {
                break;
            }
        }

        true
    }

    fn evict_one(&mut self) -> bool {
        // (count, oldest arrival) per modality
        let mut stats: HashMap<Modality, (usize, u64, &str)> = HashMap::new();
        for (id, entry) in &self.entries {
            let slot = stats
                .entry(entry.result.modality)
                .or_insert((0, u64::MAX, id.as_str()));
            slot.0 += 1;
            if entry.arrival < slot.1 {
                slot.1 = entry.arrival;
                slot.2 = id.as_str();
            }
        }

        let victim = stats
            .values()
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, _, id)| id.to_string());

        match victim {
            Some(id) => self.entries.remove(&id).is_some(),
            None => false,
        }
    }

    /// Drop entries older than `retention`; returns how many were removed
    pub fn purge(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= retention);
        before - self.entries.len()
    }

    pub fn distinct_modalities(&self) -> BTreeSet<Modality> {
        self.entries.values().map(|e| e.result.modality).collect()
    }

    /// Entries in arrival order
    pub fn by_arrival(&self) -> Vec<&PendingAnalysis> {
        let mut entries: Vec<&PendingAnalysis> = self.entries.values().collect();
        entries.sort_by_key(|e| e.arrival);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
