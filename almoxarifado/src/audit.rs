//! Append-only audit trail with a SHA-256 hash chain per audited object.
//!
//! Each record's hash covers the previous record's hash for the same object,
//! so editing or dropping an earlier record breaks verification of every
//! record after it.

use chrono::{DateTime, SecondsFormat, Utc};
use custody_policy::ActorId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Audited transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    Request,
    Approve,
    Deliver,
    Return,
    Cancel,
    Overdue,
    /// Permanent custody term opened
    Assign,
    /// Permanent custody term ended
    Unassign,
    /// Periodic check of a permanently assigned asset
    Verify,
}

impl AuditEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Approve => "APPROVE",
            Self::Deliver => "DELIVER",
            Self::Return => "RETURN",
            Self::Cancel => "CANCEL",
            Self::Overdue => "OVERDUE",
            Self::Assign => "ASSIGN",
            Self::Unassign => "UNASSIGN",
            Self::Verify => "VERIFY",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// A record does not point at its predecessor
    #[error("Audit chain for {object} is broken at record {index}")]
    BrokenLink { object: String, index: usize },

    /// A record's content no longer matches its hash
    #[error("Audit record {index} for {object} has been altered")]
    HashMismatch { object: String, index: usize },
}

/// A committed audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Audited object, e.g. `almoxarifado.cautela:<uuid>`
    pub object: String,
    pub event: AuditEvent,
    /// `None` for system jobs
    pub actor: Option<ActorId>,
    pub message: String,
    /// JSON text of the state before the transition
    pub before: String,
    /// JSON text of the state after the transition
    pub after: String,
    pub prev_hash: String,
    pub hash: String,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    fn compute_hash(&self) -> String {
        let actor = self.actor.as_ref().map(ActorId::as_str).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.at.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
        hasher.update(actor.as_bytes());
        hasher.update(self.object.as_bytes());
        hasher.update(self.event.as_str().as_bytes());
        hasher.update(self.before.as_bytes());
        hasher.update(self.after.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// An audit record before it is chained.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    object: String,
    event: AuditEvent,
    at: DateTime<Utc>,
    actor: Option<ActorId>,
    message: String,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
}

impl AuditDraft {
    pub fn new(object: impl Into<String>, event: AuditEvent, at: DateTime<Utc>) -> Self {
        Self {
            object: object.into(),
            event,
            at,
            actor: None,
            message: String::new(),
            before: None,
            after: None,
        }
    }

    pub fn by(mut self, actor: &ActorId) -> Self {
        self.actor = Some(actor.clone());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn before(mut self, state: serde_json::Value) -> Self {
        self.before = Some(state);
        self
    }

    pub fn after(mut self, state: serde_json::Value) -> Self {
        self.after = Some(state);
        self
    }
}

fn dumps(state: Option<serde_json::Value>) -> String {
    state
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()))
        .to_string()
}

/// The audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    /// Records in append order
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain and append a record; returns the committed record.
    pub async fn append(&self, draft: AuditDraft) -> AuditRecord {
        let mut records = self.records.write().await;

        let prev_hash = records
            .iter()
            .rev()
            .find(|r| r.object == draft.object)
            .map(|r| r.hash.clone())
            .unwrap_or_default();

        let mut record = AuditRecord {
            id: Uuid::new_v4(),
            object: draft.object,
            event: draft.event,
            actor: draft.actor,
            message: draft.message,
            before: dumps(draft.before),
            after: dumps(draft.after),
            prev_hash,
            hash: String::new(),
            at: draft.at,
        };
        record.hash = record.compute_hash();

        debug!(
            object = %record.object,
            event = %record.event,
            hash = %record.hash,
            "Audit record appended"
        );
        records.push(record.clone());
        record
    }

    /// Records for one object, oldest first.
    pub async fn for_object(&self, object: &str) -> Vec<AuditRecord> {
        let records = self.records.read().await;
        records.iter().filter(|r| r.object == object).cloned().collect()
    }

    /// Most recent records across all objects, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let records = self.records.read().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    /// Hash of the latest record for an object, empty if none.
    pub async fn latest_hash(&self, object: &str) -> String {
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .find(|r| r.object == object)
            .map(|r| r.hash.clone())
            .unwrap_or_default()
    }

    /// Verify an object's chain. Returns the number of records checked.
    pub async fn verify(&self, object: &str) -> Result<usize, AuditError> {
        let chain = self.for_object(object).await;
        let mut expected_prev = String::new();

        for (index, record) in chain.iter().enumerate() {
            if record.prev_hash != expected_prev {
                warn!(object, index, "Audit chain link mismatch");
                return Err(AuditError::BrokenLink {
                    object: object.to_string(),
                    index,
                });
            }
            if record.compute_hash() != record.hash {
                warn!(object, index, "Audit record hash mismatch");
                return Err(AuditError::HashMismatch {
                    object: object.to_string(),
                    index,
                });
            }
            expected_prev = record.hash.clone();
        }

        Ok(chain.len())
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> AuditTrail {
        let trail = AuditTrail::new();
        let actor = ActorId::new("U1");
        let now = Utc::now();

        trail
            .append(
                AuditDraft::new("cautela:1", AuditEvent::Request, now)
                    .by(&actor)
                    .after(json!({"status": "pending"})),
            )
            .await;
        trail
            .append(AuditDraft::new("cautela:2", AuditEvent::Request, now).by(&actor))
            .await;
        trail
            .append(
                AuditDraft::new("cautela:1", AuditEvent::Approve, now)
                    .by(&ActorId::new("S1"))
                    .before(json!({"status": "pending"}))
                    .after(json!({"status": "approved"})),
            )
            .await;
        trail
    }

    #[tokio::test]
    async fn test_chain_per_object() {
        let trail = seeded().await;

        let chain = trail.for_object("cautela:1").await;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].prev_hash, "");
        assert_eq!(chain[1].prev_hash, chain[0].hash);
        assert_eq!(chain[0].before, "{}");
        assert_eq!(trail.latest_hash("cautela:1").await, chain[1].hash);

        assert_eq!(trail.verify("cautela:1").await, Ok(2));
        assert_eq!(trail.verify("cautela:2").await, Ok(1));
        assert_eq!(trail.verify("cautela:3").await, Ok(0));
        assert_eq!(trail.count().await, 3);
        assert_eq!(trail.recent(1).await[0].event, AuditEvent::Approve);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let trail = seeded().await;

        {
            let mut records = trail.records.write().await;
            records[0].after = json!({"status": "approved"}).to_string();
        }
        assert_eq!(
            trail.verify("cautela:1").await,
            Err(AuditError::HashMismatch { object: "cautela:1".into(), index: 0 })
        );
    }

    #[tokio::test]
    async fn test_dropped_record_breaks_chain() {
        let trail = seeded().await;

        {
            let mut records = trail.records.write().await;
            records.remove(0);
        }
        assert!(matches!(
            trail.verify("cautela:1").await,
            Err(AuditError::BrokenLink { index: 0, .. })
        ));
        assert_eq!(trail.verify("cautela:2").await, Ok(1));
    }
}
