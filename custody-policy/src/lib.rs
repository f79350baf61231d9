//! Custody policy for the GCM almoxarifado (armory).
//!
//! Decides whether a proposed withdrawal or return of controlled equipment
//! may proceed. Three rules apply:
//!
//! - **Dual control**: requester, approver and issuer are distinct people
//! - **Time windows**: withdrawals and returns only inside configured local
//!   hours, unless the acting person holds the exception capability
//! - **Quantity caps**: ammunition (and optionally magazines) held after the
//!   operation stays under a cap resolved by role, then class, then default
//!
//! # Key Components
//!
//! - [`CustodyPolicy`]: Validated, fingerprinted policy loaded from YAML
//! - [`evaluate`]: Pure decision function over one [`CustodyOperation`]
//! - [`Authorizer`]: Capability lookup the evaluator depends on
//! - [`RbacCatalog`] / [`GroupAuthorizer`]: Default role groups and their grants
//!
//! # Example
//!
//! ```ignore
//! use custody_policy::{evaluate, CustodyOperation, CustodyPolicy, DenyAll, OperationKind};
//!
//! let policy = CustodyPolicy::load("almoxarifado.yaml")?;
//! let op = CustodyOperation::new(OperationKind::Withdrawal, requester, now)
//!     .with_approver("S1")
//!     .with_issuer("A1")
//!     .with_ammunition_total(45);
//!
//! if let Some(denial) = evaluate(&op, &policy, &DenyAll).denial() {
//!     eprintln!("{denial}");
//! }
//! ```

pub mod authz;
pub mod config;
pub mod evaluator;
pub mod limits;
pub mod rbac;
pub mod types;
pub mod window;

// Re-export main types
pub use authz::{Authorizer, Capability, DenyAll, StaticAuthorizer, EXCEPTION_CAPABILITY};
pub use config::{CustodyPolicy, PolicyDocument, PolicyError};
pub use evaluator::{
    check_dual_control, check_quantity, check_window, evaluate, CappedQuantity, Decision, Denial,
    Evaluation, Party, PolicyEvaluator, WindowCheck,
};
pub use limits::{CapLimits, CapSource, QuantityLimits, ResolvedCap};
pub use rbac::{GroupAuthorizer, RbacCatalog, RoleGroup};
pub use types::*;
pub use window::TimeWindow;
