//! The custody policy evaluator.
//!
//! Three independent gates, checked in a fixed order so the first failure is
//! the one reported:
//!
//! 1. dual control (segregation of requester, approver and issuer)
//! 2. time window, with an exception capability override
//! 3. quantity cap on the requester's post-operation holdings

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::authz::Authorizer;
use crate::config::CustodyPolicy;
use crate::limits::{CapSource, ResolvedCap};
use crate::types::{ActorId, CustodyOperation, OperationKind};
use crate::window::TimeWindow;

/// A participant in a custody operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Requester,
    Approver,
    Issuer,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requester => "requester",
            Self::Approver => "approver",
            Self::Issuer => "issuer",
        })
    }
}

/// The quantity a cap was exceeded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CappedQuantity {
    Ammunition,
    Magazines,
}

impl fmt::Display for CappedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ammunition => "ammunition",
            Self::Magazines => "magazine",
        })
    }
}

/// Why the policy rejected an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Denial {
    /// Two roles in the operation are held by the same identity
    #[error("Dual control: {first} and {second} must be different people (both are {actor})")]
    IdentityConflict {
        first: Party,
        second: Party,
        actor: ActorId,
    },

    /// Operation falls outside its window and no override applies
    #[error("The {kind} is outside the permitted window {window} (local time {local_time})")]
    OutsideWindow {
        kind: OperationKind,
        window: TimeWindow,
        local_time: NaiveTime,
    },

    /// Post-operation holdings exceed the resolved cap
    #[error("The {quantity} total {requested} exceeds the limit of {cap} set by {resolved_from}")]
    CapExceeded {
        quantity: CappedQuantity,
        requested: u32,
        cap: u32,
        resolved_from: CapSource,
    },
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    /// All gates passed; `window_override` is set when the time window was
    /// bypassed through the exception capability.
    Allowed { window_override: bool },
    /// A gate failed.
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Denied(denial) => Some(denial),
            Self::Allowed { .. } => None,
        }
    }

    pub fn window_override(&self) -> bool {
        matches!(self, Self::Allowed { window_override: true })
    }

    /// Convert into a `Result`, keeping the override flag on success.
    pub fn into_result(self) -> Result<bool, Denial> {
        match self {
            Self::Allowed { window_override } => Ok(window_override),
            Self::Denied(denial) => Err(denial),
        }
    }
}

/// How the time-window gate was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowCheck {
    Inside,
    Overridden,
}

/// Dual-control gate. A no-op when `dual_operation` is off; absent parties
/// are not compared.
pub fn check_dual_control(policy: &CustodyPolicy, op: &CustodyOperation) -> Result<(), Denial> {
    if !policy.dual_operation() {
        return Ok(());
    }

    let parties = [
        (Party::Requester, Some(&op.requester.id)),
        (Party::Approver, op.approver.as_ref()),
        (Party::Issuer, op.issuer.as_ref()),
    ];

    for (i, (first, a)) in parties.iter().enumerate() {
        for (second, b) in &parties[i + 1..] {
            if let (Some(a), Some(b)) = (a, b) {
                if a == b {
                    return Err(Denial::IdentityConflict {
                        first: *first,
                        second: *second,
                        actor: (*a).clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Time-window gate for the operation's kind.
pub fn check_window(
    policy: &CustodyPolicy,
    op: &CustodyOperation,
    authorizer: &dyn Authorizer,
) -> Result<WindowCheck, Denial> {
    let window = policy.window(op.kind);
    let local_time = policy.local_time(op.at);

    if window.contains(local_time) {
        return Ok(WindowCheck::Inside);
    }

    if authorizer.has_capability(&op.actor, policy.exception_permission()) {
        info!(
            actor = %op.actor,
            kind = %op.kind,
            window = %window,
            local_time = %local_time,
            "Time window overridden by exception capability"
        );
        return Ok(WindowCheck::Overridden);
    }

    Err(Denial::OutsideWindow {
        kind: op.kind,
        window: *window,
        local_time,
    })
}

/// Quantity gate. Returns the cap that was applied.
pub fn check_quantity(
    policy: &CustodyPolicy,
    op: &CustodyOperation,
) -> Result<ResolvedCap, Denial> {
    let resolved = policy.limits().resolve(&op.requester);
    debug!(
        requester = %op.requester.id,
        cap = resolved.limits.ammunition_total_max,
        source = %resolved.source,
        "Resolved quantity cap"
    );

    if op.ammunition_total > resolved.limits.ammunition_total_max {
        return Err(Denial::CapExceeded {
            quantity: CappedQuantity::Ammunition,
            requested: op.ammunition_total,
            cap: resolved.limits.ammunition_total_max,
            resolved_from: resolved.source,
        });
    }

    if let Some(max) = resolved.limits.magazines_max {
        if op.magazines_total > max {
            return Err(Denial::CapExceeded {
                quantity: CappedQuantity::Magazines,
                requested: op.magazines_total,
                cap: max,
                resolved_from: resolved.source,
            });
        }
    }

    Ok(resolved)
}

/// Evaluate an operation against the policy.
pub fn evaluate(
    op: &CustodyOperation,
    policy: &CustodyPolicy,
    authorizer: &dyn Authorizer,
) -> Decision {
    debug!(
        kind = %op.kind,
        requester = %op.requester.id,
        actor = %op.actor,
        "Evaluating custody operation"
    );

    let outcome = check_dual_control(policy, op)
        .and_then(|()| check_window(policy, op, authorizer))
        .and_then(|window| check_quantity(policy, op).map(|_| window));

    match outcome {
        Ok(window) => Decision::Allowed {
            window_override: window == WindowCheck::Overridden,
        },
        Err(denial) => {
            warn!(
                kind = %op.kind,
                requester = %op.requester.id,
                reason = %denial,
                "Custody operation denied"
            );
            Decision::Denied(denial)
        }
    }
}

/// Full record of one evaluation, for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub decision: Decision,
    /// Cap applied, when the quantity gate was reached
    pub resolved_cap: Option<ResolvedCap>,
    /// Operation time in the institutional offset
    pub local_time: NaiveTime,
    /// Fingerprint of the policy that decided
    pub policy_fingerprint: String,
}

/// A policy bound to an authorizer, shareable across request handlers.
#[derive(Clone)]
pub struct PolicyEvaluator {
    policy: Arc<CustodyPolicy>,
    authorizer: Arc<dyn Authorizer>,
}

impl PolicyEvaluator {
    pub fn new(policy: Arc<CustodyPolicy>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { policy, authorizer }
    }

    pub fn policy(&self) -> &CustodyPolicy {
        &self.policy
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer.as_ref()
    }

    /// Evaluate and return the bare decision.
    pub fn decide(&self, op: &CustodyOperation) -> Decision {
        evaluate(op, &self.policy, self.authorizer.as_ref())
    }

    /// Evaluate and keep the details needed for an audit record.
    pub fn evaluate(&self, op: &CustodyOperation) -> Evaluation {
        let decision = self.decide(op);
        let resolved_cap = match &decision {
            Decision::Allowed { .. } => Some(self.policy.limits().resolve(&op.requester)),
            Decision::Denied(Denial::CapExceeded { .. }) => {
                Some(self.policy.limits().resolve(&op.requester))
            }
            Decision::Denied(_) => None,
        };

        Evaluation {
            decision,
            resolved_cap,
            local_time: self.policy.local_time(op.at),
            policy_fingerprint: self.policy.fingerprint().to_string(),
        }
    }
}

impl fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEvaluator")
            .field("policy", &self.policy.fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Capability, DenyAll, StaticAuthorizer, EXCEPTION_CAPABILITY};
    use crate::types::ActorProfile;
    use chrono::{DateTime, Utc};

    /// 2026-03-10 at the given local (-03:00) time.
    fn local(hh_mm: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2026-03-10T{hh_mm}:00-03:00"))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn unsigned(at: &str) -> CustodyOperation {
        CustodyOperation::new(OperationKind::Withdrawal, ActorProfile::new("U1"), local(at))
    }

    fn withdrawal(at: &str) -> CustodyOperation {
        unsigned(at).with_approver("S1").with_issuer("A1")
    }

    fn unlock_for(actor: &str) -> StaticAuthorizer {
        StaticAuthorizer::new().with_grant(actor, Capability::parse(EXCEPTION_CAPABILITY).unwrap())
    }

    #[test]
    fn test_requester_as_approver_conflicts() {
        let policy = CustodyPolicy::default();
        let op = unsigned("10:00").with_approver("U1").with_issuer("U2");

        let decision = evaluate(&op, &policy, &DenyAll);
        assert_eq!(
            decision,
            Decision::Denied(Denial::IdentityConflict {
                first: Party::Requester,
                second: Party::Approver,
                actor: ActorId::new("U1"),
            })
        );
    }

    #[test]
    fn test_approver_as_issuer_conflicts() {
        let policy = CustodyPolicy::default();
        let op = unsigned("10:00").with_approver("S1").with_issuer("S1");

        let denial = check_dual_control(&policy, &op).unwrap_err();
        assert!(matches!(
            denial,
            Denial::IdentityConflict { first: Party::Approver, second: Party::Issuer, .. }
        ));
    }

    #[test]
    fn test_dual_control_disabled() {
        let policy = CustodyPolicy::from_yaml("dupla_operacao: false\n").unwrap();
        let op = unsigned("10:00").with_approver("U1").with_issuer("U1");

        assert!(evaluate(&op, &policy, &DenyAll).is_allowed());
    }

    #[test]
    fn test_absent_parties_not_compared() {
        let policy = CustodyPolicy::default();
        let op = unsigned("10:00");
        assert!(check_dual_control(&policy, &op).is_ok());
    }

    #[test]
    fn test_inside_window_ignores_capability() {
        let policy = CustodyPolicy::default();
        let op = withdrawal("07:00");

        assert_eq!(check_window(&policy, &op, &DenyAll), Ok(WindowCheck::Inside));
        assert_eq!(check_window(&policy, &op, &unlock_for("A1")), Ok(WindowCheck::Inside));
        assert_eq!(
            evaluate(&op, &policy, &unlock_for("A1")),
            Decision::Allowed { window_override: false }
        );
    }

    #[test]
    fn test_outside_window_denied() {
        let policy = CustodyPolicy::default();
        let decision = evaluate(&withdrawal("23:00"), &policy, &DenyAll);

        match decision.denial() {
            Some(Denial::OutsideWindow { kind, local_time, .. }) => {
                assert_eq!(*kind, OperationKind::Withdrawal);
                assert_eq!(*local_time, NaiveTime::from_hms_opt(23, 0, 0).unwrap());
            }
            other => panic!("expected OutsideWindow, got {other:?}"),
        }
    }

    #[test]
    fn test_exception_capability_overrides_window() {
        let policy = CustodyPolicy::default();
        let decision = evaluate(&withdrawal("23:00"), &policy, &unlock_for("A1"));

        assert_eq!(decision, Decision::Allowed { window_override: true });
        assert!(decision.window_override());
    }

    #[test]
    fn test_override_checks_acting_identity() {
        let policy = CustodyPolicy::default();
        // The requester holding the capability does not help when the issuer acts.
        let decision = evaluate(&withdrawal("23:00"), &policy, &unlock_for("U1"));
        assert!(matches!(decision.denial(), Some(Denial::OutsideWindow { .. })));
    }

    #[test]
    fn test_return_uses_return_window() {
        let policy = CustodyPolicy::from_yaml(
            "horarios:\n  devolucao_inicio: \"06:00\"\n  devolucao_fim: \"23:30\"\n",
        )
        .unwrap();
        let mut op = withdrawal("23:00");
        op.kind = OperationKind::Return;

        assert!(evaluate(&op, &policy, &DenyAll).is_allowed());
    }

    #[test]
    fn test_default_cap_boundary() {
        let policy = CustodyPolicy::default();

        let at_cap = withdrawal("10:00").with_ammunition_total(60);
        assert_eq!(
            evaluate(&at_cap, &policy, &DenyAll),
            Decision::Allowed { window_override: false }
        );

        let over = withdrawal("10:00").with_ammunition_total(61);
        assert_eq!(
            evaluate(&over, &policy, &DenyAll),
            Decision::Denied(Denial::CapExceeded {
                quantity: CappedQuantity::Ammunition,
                requested: 61,
                cap: 60,
                resolved_from: CapSource::Default,
            })
        );
    }

    #[test]
    fn test_magazine_cap() {
        let policy = CustodyPolicy::from_yaml(
            "limites:\n  por_cargo:\n    GCM:\n      \
             municao_total_max: 40\n      carregadores_max: 2\n",
        )
        .unwrap();
        let mut op = withdrawal("10:00").with_ammunition_total(30).with_magazines_total(3);
        op.requester = op.requester.clone().with_role("GCM");

        let denial = check_quantity(&policy, &op).unwrap_err();
        assert!(matches!(
            denial,
            Denial::CapExceeded { quantity: CappedQuantity::Magazines, cap: 2, .. }
        ));
    }

    #[test]
    fn test_first_failure_wins() {
        let policy = CustodyPolicy::default();
        let op = unsigned("23:30").with_approver("U1").with_ammunition_total(500);

        assert!(matches!(
            evaluate(&op, &policy, &DenyAll).denial(),
            Some(Denial::IdentityConflict { .. })
        ));

        let op = op.with_approver("S1");
        assert!(matches!(
            evaluate(&op, &policy, &DenyAll).denial(),
            Some(Denial::OutsideWindow { .. })
        ));
    }

    #[test]
    fn test_denial_messages_name_the_rule() {
        let policy = CustodyPolicy::default();
        let denial = evaluate(&withdrawal("10:00").with_ammunition_total(61), &policy, &DenyAll)
            .into_result()
            .unwrap_err();

        assert_eq!(
            denial.to_string(),
            "The ammunition total 61 exceeds the limit of 60 set by the default limit"
        );
    }

    #[test]
    fn test_policy_evaluator_records_details() {
        let policy = Arc::new(CustodyPolicy::default());
        let evaluator = PolicyEvaluator::new(policy.clone(), Arc::new(DenyAll));

        let evaluation = evaluator.evaluate(&withdrawal("10:00").with_ammunition_total(10));
        assert!(evaluation.decision.is_allowed());
        assert_eq!(evaluation.resolved_cap.unwrap().source, CapSource::Default);
        assert_eq!(evaluation.policy_fingerprint, policy.fingerprint());

        let evaluation = evaluator.evaluate(&withdrawal("23:00"));
        assert!(evaluation.resolved_cap.is_none());
    }

    #[test]
    fn test_decision_json_shape() {
        let json = serde_json::to_value(Decision::Allowed { window_override: true }).unwrap();
        assert_eq!(json["outcome"], "allowed");
        assert_eq!(json["window_override"], true);

        let denied = Decision::Denied(Denial::IdentityConflict {
            first: Party::Requester,
            second: Party::Issuer,
            actor: ActorId::new("U1"),
        });
        let json = serde_json::to_value(&denied).unwrap();
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["rule"], "identity_conflict");
    }
}
