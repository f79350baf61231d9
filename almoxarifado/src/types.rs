//! Cautela records and the item specs they are built from.

use chrono::{DateTime, Utc};
use custody_policy::{ActorId, ActorProfile};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a weapon, accessory or magazine in the asset register.
pub type AssetId = u64;

/// Identifier of an ammunition lot.
pub type LotId = u64;

/// Largest quantity accepted on one ammunition or magazine line.
pub const MAX_LINE_QUANTITY: u32 = 10_000;

/// Lifecycle of a cautela.
///
/// ```text
/// Pending ──approve──▶ Approved ──deliver──▶ Open ──return──▶ Closed
///    │                    │                   │                 ▲
///    └──cancel──┬─────────┘                   └──sweep──▶ Overdue
///               ▼
///           Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CautelaStatus {
    /// Requested, waiting for the supervisor
    Pending,
    /// Approved, ammunition reserved
    Approved,
    /// Equipment is with the requester
    Open,
    /// Returned and closed
    Closed,
    /// Open past its expected return
    Overdue,
    /// Withdrawn before delivery
    Cancelled,
}

impl CautelaStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether equipment under this status counts toward the requester's holdings.
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Approved | Self::Open | Self::Overdue)
    }

    /// Whether no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

impl fmt::Display for CautelaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a cautela line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Weapon,
    Accessory,
    Magazine,
    Ammunition,
}

impl ItemKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Weapon => "weapon",
            Self::Accessory => "accessory",
            Self::Magazine => "magazine",
            Self::Ammunition => "ammunition",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested line: an asset, or a quantity from an ammunition lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub kind: ItemKind,
    /// Asset ID, or lot ID for ammunition
    pub object_id: u64,
    pub quantity: u32,
}

impl ItemSpec {
    pub fn weapon(asset: AssetId) -> Self {
        Self::line(ItemKind::Weapon, asset, 1)
    }

    pub fn accessory(asset: AssetId) -> Self {
        Self::line(ItemKind::Accessory, asset, 1)
    }

    pub fn magazines(asset: AssetId, quantity: u32) -> Self {
        Self::line(ItemKind::Magazine, asset, quantity)
    }

    pub fn ammunition(lot: LotId, quantity: u32) -> Self {
        Self::line(ItemKind::Ammunition, lot, quantity)
    }

    const fn line(kind: ItemKind, object_id: u64, quantity: u32) -> Self {
        Self {
            kind,
            object_id,
            quantity,
        }
    }
}

/// A cautela line after validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CautelaItem {
    pub kind: ItemKind,
    pub object_id: u64,
    pub quantity: u32,
}

impl From<ItemSpec> for CautelaItem {
    fn from(spec: ItemSpec) -> Self {
        Self {
            kind: spec.kind,
            object_id: spec.object_id,
            quantity: spec.quantity,
        }
    }
}

/// A custody record for armory equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cautela {
    pub id: Uuid,
    /// Person the equipment is issued to
    pub requester: ActorProfile,
    /// Designated (then approving) supervisor
    pub supervisor: Option<ActorId>,
    /// Clerk who handed the equipment over
    pub issuer: Option<ActorId>,
    /// Clerk who received it back
    pub receiver: Option<ActorId>,
    pub status: CautelaStatus,
    pub items: Vec<CautelaItem>,
    pub reason: String,
    pub notes: String,
    pub checklist_out: Option<serde_json::Value>,
    pub checklist_back: Option<serde_json::Value>,
    pub expected_return: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub withdrawn_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Revision for optimistic concurrency; bumped by every store update
    pub rev: u32,
}

impl Cautela {
    /// Total rounds of ammunition on this cautela.
    pub fn ammunition_total(&self) -> u32 {
        self.quantity_of(ItemKind::Ammunition)
    }

    /// Total magazines on this cautela.
    pub fn magazines_total(&self) -> u32 {
        self.quantity_of(ItemKind::Magazine)
    }

    /// Saturates at `u32::MAX`, which is above any configurable cap.
    fn quantity_of(&self, kind: ItemKind) -> u32 {
        self.items
            .iter()
            .filter(|item| item.kind == kind)
            .fold(0u32, |total, item| total.saturating_add(item.quantity))
    }

    /// `(lot, quantity)` for each ammunition line.
    pub fn ammunition_lines(&self) -> Vec<(LotId, u32)> {
        self.items
            .iter()
            .filter(|item| item.kind == ItemKind::Ammunition)
            .map(|item| (item.object_id, item.quantity))
            .collect()
    }

    /// Asset IDs of the weapons on this cautela.
    pub fn weapon_ids(&self) -> Vec<AssetId> {
        self.items
            .iter()
            .filter(|item| item.kind == ItemKind::Weapon)
            .map(|item| item.object_id)
            .collect()
    }

    /// Open and past its expected return at `now`.
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CautelaStatus::Open && self.expected_return.is_some_and(|due| due < now)
    }

    /// Audit identifier for this record.
    pub fn audit_object(&self) -> String {
        format!("almoxarifado.cautela:{}", self.id)
    }

    /// State captured before and after each transition in the audit trail.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "requester": self.requester.id,
            "supervisor": self.supervisor,
            "issuer": self.issuer,
            "receiver": self.receiver,
            "expected_return": self.expected_return,
            "approved_at": self.approved_at,
            "withdrawn_at": self.withdrawn_at,
            "returned_at": self.returned_at,
            "items": self.items,
        })
    }
}

/// Running totals of what a person currently holds or has reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holdings {
    pub ammunition: u32,
    pub magazines: u32,
    /// Outstanding cautelas counted
    pub cautelas: usize,
}

impl Holdings {
    /// Sum the outstanding cautelas in `cautelas`.
    pub fn from_cautelas<'a>(cautelas: impl IntoIterator<Item = &'a Cautela>) -> Self {
        cautelas
            .into_iter()
            .filter(|c| c.status.is_outstanding())
            .fold(Self::default(), |acc, c| Self {
                ammunition: acc.ammunition.saturating_add(c.ammunition_total()),
                magazines: acc.magazines.saturating_add(c.magazines_total()),
                cautelas: acc.cautelas + 1,
            })
    }
}
