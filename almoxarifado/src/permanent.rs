//! Permanent (fixed) custody of assets.
//!
//! Some equipment stays with one officer indefinitely under a signed term
//! instead of going out on a cautela. While an assignment is open the asset
//! cannot be requested on a cautela, and the armory records periodic checks
//! that it is still with its holder and in order.

use chrono::{DateTime, Utc};
use custody_policy::ActorId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::types::AssetId;

/// Register errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermanentError {
    #[error("Permanent assignment {0} not found")]
    NotFound(Uuid),

    #[error("Asset {asset_id} is already permanently assigned to {holder}")]
    AlreadyAssigned { asset_id: AssetId, holder: ActorId },

    #[error("Permanent assignment {0} has already ended")]
    Ended(Uuid),
}

/// Outcome of a periodic check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicCheck {
    pub at: DateTime<Utc>,
    pub by: ActorId,
    /// Asset found with its holder and in order
    pub in_order: bool,
    pub notes: String,
}

/// A permanent custody term for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermanentAssignment {
    pub id: Uuid,
    pub asset_id: AssetId,
    pub holder: ActorId,
    pub assigned_by: ActorId,
    pub assigned_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub notes: String,
    pub checks: Vec<PeriodicCheck>,
}

impl PermanentAssignment {
    /// Asset is still with the holder.
    pub fn in_possession(&self) -> bool {
        self.returned_at.is_none()
    }

    pub fn last_check(&self) -> Option<&PeriodicCheck> {
        self.checks.last()
    }

    pub fn audit_object(&self) -> String {
        format!("almoxarifado.cautelapermanente:{}", self.id)
    }
}

/// In-memory register of permanent assignments.
#[derive(Debug, Default)]
pub struct PermanentRegister {
    assignments: DashMap<Uuid, PermanentAssignment>,
}

impl PermanentRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an assignment. An asset has at most one open assignment.
    pub fn assign(
        &self,
        asset_id: AssetId,
        holder: &ActorId,
        assigned_by: &ActorId,
        at: DateTime<Utc>,
        notes: impl Into<String>,
    ) -> Result<PermanentAssignment, PermanentError> {
        if let Some(current) = self.current_for_asset(asset_id) {
            return Err(PermanentError::AlreadyAssigned {
                asset_id,
                holder: current.holder,
            });
        }

        let assignment = PermanentAssignment {
            id: Uuid::new_v4(),
            asset_id,
            holder: holder.clone(),
            assigned_by: assigned_by.clone(),
            assigned_at: at,
            returned_at: None,
            notes: notes.into(),
            checks: Vec::new(),
        };
        self.assignments.insert(assignment.id, assignment.clone());

        info!(
            assignment_id = %assignment.id,
            asset_id,
            holder = %holder,
            "Permanent assignment opened"
        );
        Ok(assignment)
    }

    /// Record the asset's return and close the assignment.
    pub fn end(&self, id: Uuid, at: DateTime<Utc>) -> Result<PermanentAssignment, PermanentError> {
        let mut assignment = self
            .assignments
            .get_mut(&id)
            .ok_or(PermanentError::NotFound(id))?;
        if !assignment.in_possession() {
            return Err(PermanentError::Ended(id));
        }
        assignment.returned_at = Some(at);

        info!(assignment_id = %id, asset_id = assignment.asset_id, "Permanent assignment ended");
        Ok(assignment.clone())
    }

    /// Append a periodic check to an open assignment.
    pub fn record_check(
        &self,
        id: Uuid,
        check: PeriodicCheck,
    ) -> Result<PermanentAssignment, PermanentError> {
        let mut assignment = self
            .assignments
            .get_mut(&id)
            .ok_or(PermanentError::NotFound(id))?;
        if !assignment.in_possession() {
            return Err(PermanentError::Ended(id));
        }
        assignment.checks.push(check);
        Ok(assignment.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<PermanentAssignment> {
        self.assignments.get(&id).map(|a| a.clone())
    }

    /// Open assignment of an asset, if any.
    pub fn current_for_asset(&self, asset_id: AssetId) -> Option<PermanentAssignment> {
        self.assignments
            .iter()
            .find(|a| a.asset_id == asset_id && a.in_possession())
            .map(|a| a.clone())
    }

    /// Every assignment of a holder, newest first.
    pub fn for_holder(&self, holder: &ActorId) -> Vec<PermanentAssignment> {
        let mut assignments: Vec<_> = self
            .assignments
            .iter()
            .filter(|a| &a.holder == holder)
            .map(|a| a.clone())
            .collect();
        assignments.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        assignments
    }
}
