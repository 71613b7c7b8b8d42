//! Exact inner-product search over unit vectors.
//!
//! Removal tombstones a slot instead of shifting storage, so retiring a
//! document costs as much as the number of its chunks. Tombstoned slots are
//! reclaimed only by [`VectorIndex::compact`].

use crate::error::IndexError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct Slot {
    chunk_id: String,
    vector: Vec<f32>,
    live: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dimension: Option<usize>,
    slots: Vec<Slot>,
    live: HashMap<String, usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            ..Self::default()
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.live.contains_key(chunk_id)
    }

    /// Inserts or replaces the vector for `chunk_id`. The first insert fixes
    /// the dimension.
    pub fn add(&mut self, chunk_id: &str, vector: Vec<f32>) -> Result<(), IndexError> {
        if vector.is_empty() || vector.iter().any(|value| !value.is_finite()) {
            return Err(IndexError::InvalidVector {
                chunk_id: chunk_id.to_string(),
                reason: "vector is empty or has non-finite values".to_string(),
            });
        }
        match self.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                })
            }
            Some(_) => {}
            None => self.dimension = Some(vector.len()),
        }

        self.remove(chunk_id);
        self.live.insert(chunk_id.to_string(), self.slots.len());
        self.slots.push(Slot {
            chunk_id: chunk_id.to_string(),
            vector,
            live: true,
        });
        Ok(())
    }

    pub fn remove(&mut self, chunk_id: &str) -> bool {
        match self.live.remove(chunk_id) {
            Some(position) => {
                self.slots[position].live = false;
                true
            }
            None => false,
        }
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, IndexError> {
        self.search_filtered(query, k, |_| true)
    }

    /// Top `k` live entries accepted by `keep`, by similarity then chunk id.
    pub fn search_filtered<F>(
        &self,
        query: &[f32],
        k: usize,
        keep: F,
    ) -> Result<Vec<VectorHit>, IndexError>
    where
        F: Fn(&str) -> bool,
    {
        let Some(dimension) = self.dimension else {
            return Ok(Vec::new());
        };
        if query.len() != dimension {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }

        let mut hits: Vec<VectorHit> = self
            .slots
            .iter()
            .filter(|slot| slot.live && keep(&slot.chunk_id))
            .map(|slot| VectorHit {
                chunk_id: slot.chunk_id.clone(),
                score: dot(query, &slot.vector),
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    pub fn tombstones(&self) -> usize {
        self.slots.len() - self.live.len()
    }

    pub fn tombstone_ratio(&self) -> f64 {
        if self.slots.is_empty() {
            0.0
        } else {
            self.tombstones() as f64 / self.slots.len() as f64
        }
    }

    /// Rebuilds storage without tombstones; returns how many were dropped.
    pub fn compact(&mut self) -> usize {
        let dropped = self.tombstones();
        if dropped == 0 {
            return 0;
        }
        self.slots.retain(|slot| slot.live);
        self.live = self
            .slots
            .iter()
            .enumerate()
            .map(|(position, slot)| (slot.chunk_id.clone(), position))
            .collect();
        dropped
    }

    /// Live entries ordered by chunk id.
    pub fn entries(&self) -> Vec<VectorEntry> {
        let mut entries: Vec<VectorEntry> = self
            .slots
            .iter()
            .filter(|slot| slot.live)
            .map(|slot| VectorEntry {
                chunk_id: slot.chunk_id.clone(),
                vector: slot.vector.clone(),
            })
            .collect();
        entries.sort_by(|left, right| left.chunk_id.cmp(&right.chunk_id));
        entries
    }

    pub fn from_entries(
        dimension: Option<usize>,
        entries: Vec<VectorEntry>,
    ) -> Result<Self, IndexError> {
        let mut index = Self {
            dimension,
            ..Self::default()
        };
        for entry in entries {
            if index.contains(&entry.chunk_id) {
                return Err(IndexError::InvalidVector {
                    chunk_id: entry.chunk_id,
                    reason: "duplicate entry".to_string(),
                });
            }
            index.add(&entry.chunk_id, entry.vector)?;
        }
        Ok(index)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.live.keys().map(String::as_str)
    }
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}
