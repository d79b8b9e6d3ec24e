//! Conflict Resolution Engine
//!
//! Decides who wins when several agents claim the same resource or task
//! and keeps an audit trail of every decision. Resolution never fails the
//! caller outright: [`ConflictResolver::settle`] falls back to the current
//! holder when a strategy cannot produce a winner.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::priority::Priority;
use crate::types::{AgentId, ConflictId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ResourceContention,
    TaskOwnershipConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Highest agent priority wins, earliest claim on ties
    Priority,
    /// First come, first served
    Timestamp,
    /// Weighted votes, ties broken by agent id
    Voting,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResolutionStrategy::Priority => "priority",
            ResolutionStrategy::Timestamp => "timestamp",
            ResolutionStrategy::Voting => "voting",
        };
        f.write_str(label)
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(ResolutionStrategy::Priority),
            "timestamp" | "fifo" => Ok(ResolutionStrategy::Timestamp),
            "voting" | "vote" => Ok(ResolutionStrategy::Voting),
            other => Err(format!("unknown resolution strategy: {other}")),
        }
    }
}

/// One agent's claim in a conflict
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Claimant {
    pub agent_id: AgentId,
    pub priority: Priority,
    pub claimed_at: DateTime<Utc>,
    /// Engine-local ordering of claims; breaks timestamp ties
    pub sequence: u64,
}

/// Contradictory claims over one entity
#[derive(Debug, Clone, Serialize)]
pub struct ConflictClaim {
    pub kind: ConflictKind,
    pub entity_id: String,
    pub participants: Vec<Claimant>,
    /// Who owns the entity right now, if anyone
    pub current_holder: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: AgentId,
    pub candidate: AgentId,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    Resolved,
    /// No strategy result; the current holder kept ownership
    DefaultedToHolder,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub kind: ConflictKind,
    pub entity_id: String,
    pub participants: Vec<AgentId>,
    pub strategy: ResolutionStrategy,
    pub resolved_winner: Option<AgentId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
    pub outcome: ConflictOutcome,
    pub reason: Option<String>,
}

impl ConflictRecord {
    /// Participants that did not win
    pub fn losers(&self) -> Vec<AgentId> {
        self.participants
            .iter()
            .filter(|agent| Some(*agent) != self.resolved_winner.as_ref())
            .cloned()
            .collect()
    }
}

/// Aggregate counters for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConflictStats {
    pub recorded: u64,
    pub resolved: u64,
    pub unresolved: u64,
}

pub struct ConflictResolver {
    records: Mutex<VecDeque<ConflictRecord>>,
    retention: usize,
    quorum: f64,
    events: EventBus,
    resolved: AtomicU64,
    unresolved: AtomicU64,
}

impl ConflictResolver {
    pub fn new(retention: usize, quorum: f64, events: EventBus) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
            quorum,
            events,
            resolved: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
        }
    }

    /// Apply `strategy` to `claim`. `expected_voters` is the number of
    /// agents asked to vote; it only matters for `Voting`.
    pub fn resolve(
        &self,
        claim: &ConflictClaim,
        strategy: ResolutionStrategy,
        votes: &[Vote],
        expected_voters: usize,
    ) -> Result<ConflictRecord> {
        let winner = self.pick_winner(claim, strategy, votes, expected_voters)?;

        let now = Utc::now();
        let record = ConflictRecord {
            id: ConflictId::generate(),
            kind: claim.kind,
            entity_id: claim.entity_id.clone(),
            participants: participant_ids(claim),
            strategy,
            resolved_winner: Some(winner.clone()),
            resolved_at: Some(now),
            detected_at: now,
            outcome: ConflictOutcome::Resolved,
            reason: None,
        };

        info!(
            conflict_id = %record.id,
            entity_id = %record.entity_id,
            strategy = %strategy,
            winner = %winner,
            "Conflict resolved"
        );
        self.resolved.fetch_add(1, Ordering::Relaxed);
        self.events.emit(CoordinationEvent::ConflictResolved {
            conflict_id: record.id.clone(),
            kind: record.kind,
            entity_id: record.entity_id.clone(),
            strategy,
            winner,
        });
        self.store(record.clone());
        Ok(record)
    }

    /// Like [`resolve`](Self::resolve), but an unresolvable conflict
    /// leaves ownership with the current holder and is reported as a
    /// warning instead of an error.
    pub fn settle(
        &self,
        claim: &ConflictClaim,
        strategy: ResolutionStrategy,
        votes: &[Vote],
        expected_voters: usize,
    ) -> ConflictRecord {
        match self.resolve(claim, strategy, votes, expected_voters) {
            Ok(record) => record,
            Err(err) => {
                let reason = match err {
                    CoordinationError::ConflictUnresolved { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.record_unresolved(claim, strategy, reason)
            }
        }
    }

    fn record_unresolved(
        &self,
        claim: &ConflictClaim,
        strategy: ResolutionStrategy,
        reason: String,
    ) -> ConflictRecord {
        let now = Utc::now();
        let record = ConflictRecord {
            id: ConflictId::generate(),
            kind: claim.kind,
            entity_id: claim.entity_id.clone(),
            participants: participant_ids(claim),
            strategy,
            resolved_winner: claim.current_holder.clone(),
            resolved_at: Some(now),
            detected_at: now,
            outcome: ConflictOutcome::DefaultedToHolder,
            reason: Some(reason.clone()),
        };

        warn!(
            conflict_id = %record.id,
            entity_id = %record.entity_id,
            strategy = %strategy,
            retained_by = ?record.resolved_winner,
            reason = %reason,
            "Conflict unresolved, current holder retains ownership"
        );
        self.unresolved.fetch_add(1, Ordering::Relaxed);
        self.events.emit(CoordinationEvent::ConflictUnresolved {
            conflict_id: record.id.clone(),
            entity_id: record.entity_id.clone(),
            retained_by: record.resolved_winner.clone(),
            reason,
        });
        self.store(record.clone());
        record
    }

    fn pick_winner(
        &self,
        claim: &ConflictClaim,
        strategy: ResolutionStrategy,
        votes: &[Vote],
        expected_voters: usize,
    ) -> Result<AgentId> {
        let unresolved = |reason: &str| CoordinationError::ConflictUnresolved {
            entity_id: claim.entity_id.clone(),
            reason: reason.to_string(),
        };

        if claim.participants.is_empty() {
            return Err(unresolved("no participants"));
        }

        let earliest = |a: &&Claimant, b: &&Claimant| {
            a.claimed_at
                .cmp(&b.claimed_at)
                .then(a.sequence.cmp(&b.sequence))
        };

        match strategy {
            ResolutionStrategy::Priority => claim
                .participants
                .iter()
                .min_by(|a, b| b.priority.cmp(&a.priority).then_with(|| earliest(a, b)))
                .map(|c| c.agent_id.clone())
                .ok_or_else(|| unresolved("no participants")),
            ResolutionStrategy::Timestamp => claim
                .participants
                .iter()
                .min_by(earliest)
                .map(|c| c.agent_id.clone())
                .ok_or_else(|| unresolved("no participants")),
            ResolutionStrategy::Voting => {
                let candidates: HashSet<&AgentId> =
                    claim.participants.iter().map(|c| &c.agent_id).collect();

                // One vote per voter; later duplicates are ignored
                let mut seen_voters = HashSet::new();
                let mut tally: BTreeMap<&AgentId, f64> = BTreeMap::new();
                let mut cast = 0.0;
                for vote in votes {
                    if vote.weight <= 0.0 || !candidates.contains(&vote.candidate) {
                        continue;
                    }
                    if !seen_voters.insert(&vote.voter) {
                        continue;
                    }
                    *tally.entry(&vote.candidate).or_insert(0.0) += vote.weight;
                    cast += vote.weight;
                }

                let required = self.quorum * expected_voters.max(1) as f64;
                if cast < required {
                    return Err(unresolved(&format!(
                        "voting quorum not reached ({cast:.2} of {required:.2} weight)"
                    )));
                }

                // BTreeMap iterates by agent id, so the first maximum wins ties
                let mut best: Option<(&AgentId, f64)> = None;
                for (candidate, weight) in tally {
                    if best.map_or(true, |(_, top)| weight > top) {
                        best = Some((candidate, weight));
                    }
                }
                best.map(|(agent, _)| agent.clone())
                    .ok_or_else(|| unresolved("no valid votes"))
            }
        }
    }

    fn store(&self, record: ConflictRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.retention {
            records.pop_front();
        }
    }

    /// Retained records, oldest first
    pub fn records(&self) -> Vec<ConflictRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<ConflictRecord> {
        let records = self.records.lock();
        records.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> ConflictStats {
        let resolved = self.resolved.load(Ordering::Relaxed);
        let unresolved = self.unresolved.load(Ordering::Relaxed);
        ConflictStats {
            recorded: resolved + unresolved,
            resolved,
            unresolved,
        }
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("retained", &self.records.lock().len())
            .field("retention", &self.retention)
            .field("quorum", &self.quorum)
            .finish()
    }
}

fn participant_ids(claim: &ConflictClaim) -> Vec<AgentId> {
    claim.participants.iter().map(|c| c.agent_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn claimant(id: &str, priority: i32, offset_ms: i64, sequence: u64) -> Claimant {
        Claimant {
            agent_id: AgentId::new(id),
            priority: Priority(priority),
            claimed_at: DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(offset_ms),
            sequence,
        }
    }

    fn claim(participants: Vec<Claimant>, holder: Option<&str>) -> ConflictClaim {
        ConflictClaim {
            kind: ConflictKind::TaskOwnershipConflict,
            entity_id: "task-1".to_string(),
            participants,
            current_holder: holder.map(AgentId::new),
        }
    }

    fn vote(voter: &str, candidate: &str, weight: f64) -> Vote {
        Vote {
            voter: AgentId::new(voter),
            candidate: AgentId::new(candidate),
            weight,
        }
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(10, 0.5, EventBus::new(64))
    }

    #[test]
    fn test_priority_strategy_prefers_higher_priority_then_earlier_claim() {
        let resolver = resolver();
        let c = claim(
            vec![
                claimant("a", 5, 0, 0),
                claimant("b", 10, 5, 1),
                claimant("c", 10, 1, 2),
            ],
            Some("a"),
        );
        let record = resolver.resolve(&c, ResolutionStrategy::Priority, &[], 0).unwrap();
        assert_eq!(record.resolved_winner, Some(AgentId::new("c")));
        assert_eq!(record.losers(), vec![AgentId::new("a"), AgentId::new("b")]);
    }

    #[test]
    fn test_timestamp_strategy_is_first_come_first_served() {
        let resolver = resolver();
        let c = claim(
            vec![claimant("late", 100, 10, 1), claimant("early", 1, 0, 0)],
            None,
        );
        let record = resolver.resolve(&c, ResolutionStrategy::Timestamp, &[], 0).unwrap();
        assert_eq!(record.resolved_winner, Some(AgentId::new("early")));
    }

    #[test]
    fn test_voting_tie_broken_by_agent_id() {
        let resolver = resolver();
        let c = claim(vec![claimant("b", 5, 0, 0), claimant("a", 5, 0, 1)], Some("b"));
        let votes = vec![vote("v1", "b", 1.0), vote("v2", "a", 1.0)];
        let record = resolver.resolve(&c, ResolutionStrategy::Voting, &votes, 2).unwrap();
        assert_eq!(record.resolved_winner, Some(AgentId::new("a")));
    }

    #[test]
    fn test_voting_weights_and_duplicate_voters() {
        let resolver = resolver();
        let c = claim(vec![claimant("a", 5, 0, 0), claimant("b", 5, 0, 1)], None);
        let votes = vec![
            vote("v1", "b", 2.5),
            vote("v2", "a", 1.0),
            vote("v3", "a", 1.0),
            vote("v1", "a", 10.0),
        ];
        let record = resolver.resolve(&c, ResolutionStrategy::Voting, &votes, 3).unwrap();
        assert_eq!(record.resolved_winner, Some(AgentId::new("b")));
    }

    #[test]
    fn test_missing_quorum_defaults_to_holder() {
        let resolver = resolver();
        let mut events = resolver.events.subscribe();
        let c = claim(vec![claimant("a", 5, 0, 0), claimant("b", 9, 0, 1)], Some("a"));

        let err = resolver
            .resolve(&c, ResolutionStrategy::Voting, &[vote("v1", "b", 1.0)], 4)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ConflictUnresolved { .. }));

        let record = resolver.settle(&c, ResolutionStrategy::Voting, &[vote("v1", "b", 1.0)], 4);
        assert_eq!(record.outcome, ConflictOutcome::DefaultedToHolder);
        assert_eq!(record.resolved_winner, Some(AgentId::new("a")));
        assert!(record.reason.unwrap().contains("quorum"));

        let names: Vec<&str> = events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["conflict_unresolved"]);
    }

    #[test]
    fn test_records_respect_retention() {
        let resolver = ConflictResolver::new(2, 0.5, EventBus::new(64));
        for i in 0..5 {
            let c = ConflictClaim {
                kind: ConflictKind::ResourceContention,
                entity_id: format!("r{i}"),
                participants: vec![claimant("a", 5, 0, 0)],
                current_holder: None,
            };
            resolver.resolve(&c, ResolutionStrategy::Priority, &[], 0).unwrap();
        }
        let records = resolver.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entity_id, "r3");
        assert_eq!(resolver.stats().recorded, 5);
        assert_eq!(resolver.recent(1)[0].entity_id, "r4");
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Voting".parse::<ResolutionStrategy>(), Ok(ResolutionStrategy::Voting));
        assert_eq!("fifo".parse::<ResolutionStrategy>(), Ok(ResolutionStrategy::Timestamp));
        assert!("coin-flip".parse::<ResolutionStrategy>().is_err());
    }
}
