//! End-to-end decisions against policies loaded the way deployments load them.

use chrono::{DateTime, Utc};
use custody_policy::{
    evaluate, ActorId, ActorProfile, Authorizer, CapSource, Capability, CappedQuantity,
    CustodyOperation, CustodyPolicy, Decision, Denial, DenyAll, GroupAuthorizer, OperationKind,
    Party, PolicyError, RbacCatalog, RoleGroup, EXCEPTION_CAPABILITY,
};
use std::io::Write;

const POLICY_YAML: &str = r#"
dupla_operacao: true
horarios:
  retirada_inicio: "07:00"
  retirada_fim: "22:00"
  devolucao_inicio: "07:00"
  devolucao_fim: "22:00"
limites:
  por_cargo:
    Guarda Civil Municipal:
      municao_total_max: 40
  por_classe:
    3C:
      municao_total_max: 60
  default:
    municao_total_max: 60
permissao_excecao: almoxarifado.desbloquear_excecao
"#;

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

fn policy() -> CustodyPolicy {
    CustodyPolicy::from_yaml(POLICY_YAML).unwrap()
}

fn withdrawal(requester: ActorProfile, when: &str) -> CustodyOperation {
    CustodyOperation::new(OperationKind::Withdrawal, requester, at(when))
        .with_approver("S1")
        .with_issuer("A1")
}

#[test]
fn test_requester_approving_own_custody_is_denied() {
    let op = CustodyOperation::new(
        OperationKind::Withdrawal,
        ActorProfile::new("U1"),
        at("2026-03-10T10:00:00-03:00"),
    )
    .with_approver("U1")
    .with_issuer("U2");

    match evaluate(&op, &policy(), &DenyAll) {
        Decision::Denied(Denial::IdentityConflict { first, second, actor }) => {
            assert_eq!(first, Party::Requester);
            assert_eq!(second, Party::Approver);
            assert_eq!(actor.as_str(), "U1");
        }
        other => panic!("expected IdentityConflict, got {other:?}"),
    }
}

#[test]
fn test_late_withdrawal_without_exception_is_denied() {
    // 23:00 local is 02:00 UTC the next day.
    let op = withdrawal(ActorProfile::new("U1"), "2026-03-11T02:00:00Z");

    let decision = evaluate(&op, &policy(), &DenyAll);
    assert!(matches!(
        decision,
        Decision::Denied(Denial::OutsideWindow { kind: OperationKind::Withdrawal, .. })
    ));
}

#[test]
fn test_late_withdrawal_with_supervisor_issuing_is_overridden() {
    let authz = GroupAuthorizer::new(RbacCatalog::bootstrap())
        .with_member("A1", RoleGroup::Almoxarife)
        .with_member("S2", RoleGroup::Supervisor);

    // The clerk alone cannot unlock the window.
    let op = withdrawal(ActorProfile::new("U1"), "2026-03-10T23:00:00-03:00");
    assert!(!evaluate(&op, &policy(), &authz).is_allowed());

    // A supervisor handing over the equipment can.
    let op = CustodyOperation::new(
        OperationKind::Withdrawal,
        ActorProfile::new("U1"),
        at("2026-03-10T23:00:00-03:00"),
    )
    .with_approver("S1")
    .with_issuer("S2");
    assert_eq!(
        evaluate(&op, &policy(), &authz),
        Decision::Allowed { window_override: true }
    );
}

#[test]
fn test_inside_window_never_reports_override() {
    let authz = GroupAuthorizer::new(RbacCatalog::bootstrap())
        .with_member("A1", RoleGroup::Administrador);
    let op = withdrawal(ActorProfile::new("U1"), "2026-03-10T12:00:00-03:00");

    let unlock = Capability::parse(EXCEPTION_CAPABILITY).unwrap();
    assert!(authz.has_capability(&ActorId::new("A1"), &unlock));
    assert_eq!(
        evaluate(&op, &policy(), &authz),
        Decision::Allowed { window_override: false }
    );
}

#[test]
fn test_role_cap_beats_class_cap() {
    let requester = ActorProfile::new("U1")
        .with_role("Guarda Civil Municipal")
        .with_class("3C");

    let op = withdrawal(requester.clone(), "2026-03-10T10:00:00-03:00").with_ammunition_total(40);
    assert!(evaluate(&op, &policy(), &DenyAll).is_allowed());

    let op = withdrawal(requester, "2026-03-10T10:00:00-03:00").with_ammunition_total(41);
    assert_eq!(
        evaluate(&op, &policy(), &DenyAll),
        Decision::Denied(Denial::CapExceeded {
            quantity: CappedQuantity::Ammunition,
            requested: 41,
            cap: 40,
            resolved_from: CapSource::Role("Guarda Civil Municipal".into()),
        })
    );
}

#[test]
fn test_default_cap_boundary() {
    let requester = ActorProfile::new("U9").with_role("Inspetor").with_class("1A");

    let op = withdrawal(requester.clone(), "2026-03-10T10:00:00-03:00").with_ammunition_total(60);
    assert!(evaluate(&op, &policy(), &DenyAll).is_allowed());

    let op = withdrawal(requester, "2026-03-10T10:00:00-03:00").with_ammunition_total(61);
    let denial = evaluate(&op, &policy(), &DenyAll).into_result().unwrap_err();
    assert!(matches!(
        denial,
        Denial::CapExceeded { cap: 60, resolved_from: CapSource::Default, .. }
    ));
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(POLICY_YAML.as_bytes()).unwrap();

    let loaded = CustodyPolicy::load(file.path()).unwrap();
    assert_eq!(loaded.fingerprint(), policy().fingerprint());
    assert_eq!(loaded.window(OperationKind::Return).to_string(), "07:00-22:00");
}

#[test]
fn test_load_rejects_bad_documents() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"horarios:\n  retirada_inicio: \"7h\"\n").unwrap();
    assert!(matches!(
        CustodyPolicy::load(file.path()),
        Err(PolicyError::InvalidClock { .. })
    ));

    let missing = CustodyPolicy::load("/nonexistent/almoxarifado.yaml");
    assert!(matches!(missing, Err(PolicyError::Io { .. })));
}
