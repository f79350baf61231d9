//! Core types shared by the policy and its callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a person taking part in a custody operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ActorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The requester as seen by the quantity cap resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorProfile {
    /// Identity of the requester
    pub id: ActorId,
    /// Cargo, e.g. "Guarda Civil Municipal"
    #[serde(default)]
    pub role: Option<String>,
    /// Functional class code, e.g. "3C"
    #[serde(default)]
    pub class: Option<String>,
}

impl ActorProfile {
    /// Create a profile with no role or class.
    pub fn new(id: impl Into<ActorId>) -> Self {
        Self {
            id: id.into(),
            role: None,
            class: None,
        }
    }

    /// Builder: set the role (cargo).
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Builder: set the functional class.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }
}

/// Which side of a custody the operation is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Retirada: equipment leaves the armory
    Withdrawal,
    /// Devolução: equipment comes back
    Return,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Withdrawal => "withdrawal",
            Self::Return => "return",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed checkout or return, submitted for evaluation before commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyOperation {
    /// Withdrawal or return
    pub kind: OperationKind,
    /// Person the equipment is (or was) issued to
    pub requester: ActorProfile,
    /// Supervisor who approved the custody
    pub approver: Option<ActorId>,
    /// Armory clerk handing over or receiving the equipment
    pub issuer: Option<ActorId>,
    /// Identity whose capabilities are checked for window overrides
    pub actor: ActorId,
    /// When the operation takes place
    pub at: DateTime<Utc>,
    /// Requester's ammunition total once this operation commits
    pub ammunition_total: u32,
    /// Requester's magazine count once this operation commits
    pub magazines_total: u32,
}

impl CustodyOperation {
    /// Create an operation acted on by the requester, with zero holdings.
    pub fn new(kind: OperationKind, requester: ActorProfile, at: DateTime<Utc>) -> Self {
        let actor = requester.id.clone();
        Self {
            kind,
            requester,
            approver: None,
            issuer: None,
            actor,
            at,
            ammunition_total: 0,
            magazines_total: 0,
        }
    }

    /// Builder: set the approver.
    pub fn with_approver(mut self, approver: impl Into<ActorId>) -> Self {
        self.approver = Some(approver.into());
        self
    }

    /// Builder: set the issuer. The issuer also becomes the acting identity.
    pub fn with_issuer(mut self, issuer: impl Into<ActorId>) -> Self {
        let issuer = issuer.into();
        self.actor = issuer.clone();
        self.issuer = Some(issuer);
        self
    }

    /// Builder: override the acting identity.
    pub fn acting_as(mut self, actor: impl Into<ActorId>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Builder: set the post-operation ammunition total.
    pub fn with_ammunition_total(mut self, total: u32) -> Self {
        self.ammunition_total = total;
        self
    }

    /// Builder: set the post-operation magazine count.
    pub fn with_magazines_total(mut self, total: u32) -> Self {
        self.magazines_total = total;
        self
    }
}
