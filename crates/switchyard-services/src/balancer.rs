//! Per-service connection pool and receiver selection.
//!
//! Round-robin walks members in insertion order. Weighted selection is
//! smooth weighted round-robin: every pick adds each member's weight to its
//! running score, takes the highest score and subtracts the total weight
//! from it, so a member with weight w is chosen w times per cycle of
//! sum(weights) picks, evenly spread. Weight 0 members only take part in
//! round-robin.

use bytes::Bytes;

use switchyard_core::LbStrategy;

#[derive(Debug, Clone)]
struct Member {
    routing_id: Bytes,
    weight: u32,
    score: i64,
}

#[derive(Debug, Default)]
pub struct Pool {
    members: Vec<Member>,
    cursor: usize,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, routing_id: &[u8]) -> bool {
        self.position(routing_id).is_some()
    }

    pub fn routing_ids(&self) -> impl Iterator<Item = &Bytes> {
        self.members.iter().map(|m| &m.routing_id)
    }

    /// Add a member at the end. An existing member only has its weight
    /// updated. Returns whether the member is new.
    pub fn add(&mut self, routing_id: Bytes, weight: u32) -> bool {
        if self.set_weight(&routing_id, weight) {
            return false;
        }
        self.members.push(Member {
            routing_id,
            weight,
            score: 0,
        });
        true
    }

    pub fn remove(&mut self, routing_id: &[u8]) -> bool {
        let Some(idx) = self.position(routing_id) else {
            return false;
        };
        self.members.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        true
    }

    pub fn set_weight(&mut self, routing_id: &[u8], weight: u32) -> bool {
        match self.position(routing_id) {
            Some(idx) => {
                let m = &mut self.members[idx];
                if m.weight != weight {
                    m.weight = weight;
                    m.score = 0;
                }
                true
            }
            None => false,
        }
    }

    /// Next member under `strategy`, or `None` if nothing is eligible.
    pub fn select(&mut self, strategy: LbStrategy) -> Option<Bytes> {
        match strategy {
            LbStrategy::RoundRobin => self.round_robin(),
            LbStrategy::Weighted => self.weighted(),
        }
    }

    fn round_robin(&mut self) -> Option<Bytes> {
        if self.members.is_empty() {
            return None;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        let picked = self.members[self.cursor].routing_id.clone();
        self.cursor = (self.cursor + 1) % self.members.len();
        Some(picked)
    }

    fn weighted(&mut self) -> Option<Bytes> {
        let total: i64 = self.members.iter().map(|m| i64::from(m.weight)).sum();
        if total == 0 {
            return None;
        }
        for m in self.members.iter_mut() {
            m.score += i64::from(m.weight);
        }
        // Ties go to the earlier member.
        let mut best: Option<usize> = None;
        for (i, m) in self.members.iter().enumerate() {
            if m.weight == 0 {
                continue;
            }
            if best.map_or(true, |b| m.score > self.members[b].score) {
                best = Some(i);
            }
        }
        let idx = best?;
        self.members[idx].score -= total;
        Some(self.members[idx].routing_id.clone())
    }

    fn position(&self, routing_id: &[u8]) -> Option<usize> {
        self.members.iter().position(|m| m.routing_id == routing_id)
    }
}
