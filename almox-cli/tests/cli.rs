//! Runs the built binary against policy files on disk.

use std::io::Write;
use std::process::{Command, Output};

const POLICY_YAML: &str = r#"
dupla_operacao: true
horarios:
  retirada_inicio: "08:00"
  retirada_fim: "18:00"
limites:
  por_cargo:
    Guarda Civil Municipal:
      municao_total_max: 40
  default:
    municao_total_max: 60
"#;

fn almox(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_almox-cli"));
    cmd.env_clear().args(args);
    cmd
}

fn policy_file(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_check_with_defaults() {
    let output = almox(&["check"]).output().unwrap();

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Policy OK"));
    assert!(text.contains("withdrawal window: 07:00-22:00"));
}

#[test]
fn test_check_reads_policy_file() {
    let file = policy_file(POLICY_YAML);
    let output = almox(&["--policy", file.path().to_str().unwrap(), "check"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("withdrawal window: 08:00-18:00"));
    assert!(text.contains("role caps:         1"));
}

#[test]
fn test_policy_file_from_environment() {
    let file = policy_file(POLICY_YAML);
    let output = almox(&["check"])
        .env("ALMOX_POLICY_FILE", file.path())
        .output()
        .unwrap();

    assert!(output.status.success());
    assert!(stdout(&output).contains("08:00-18:00"));
}

#[test]
fn test_environment_overrides_cap() {
    let output = almox(&["check"])
        .env("ALMOX_MUNICAO_TOTAL_MAX", "90")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert!(stdout(&output).contains("default cap:       90"));
}

#[test]
fn test_bad_policy_fails() {
    let inverted = policy_file(
        "horarios:\n  retirada_inicio: \"22:00\"\n  retirada_fim: \"07:00\"\n",
    );
    let output = almox(&["--policy", inverted.path().to_str().unwrap(), "check"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());

    let missing = almox(&["--policy", "/nonexistent/almoxarifado.yaml", "check"])
        .output()
        .unwrap();
    assert_eq!(missing.status.code(), Some(1));
}

#[test]
fn test_show_is_loadable() {
    let file = policy_file(POLICY_YAML);
    let output = almox(&["--policy", file.path().to_str().unwrap(), "show"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let shown = custody_policy::CustodyPolicy::from_yaml(&stdout(&output)).unwrap();
    let original = custody_policy::CustodyPolicy::from_yaml(POLICY_YAML).unwrap();
    assert_eq!(shown.fingerprint(), original.fingerprint());
}

#[test]
fn test_evaluate_exit_codes() {
    let file = policy_file(POLICY_YAML);
    let policy = file.path().to_str().unwrap();

    #[rustfmt::skip]
    let allowed = almox(&[
        "--policy", policy,
        "evaluate",
        "--requester", "U1",
        "--role", "Guarda Civil Municipal",
        "--approver", "S1",
        "--issuer", "A1",
        "--ammunition", "40",
        "--at", "2026-03-10T12:00:00-03:00",
    ])
    .output()
    .unwrap();
    assert!(allowed.status.success());

    #[rustfmt::skip]
    let denied = almox(&[
        "--policy", policy,
        "evaluate",
        "--requester", "U1",
        "--role", "Guarda Civil Municipal",
        "--approver", "S1",
        "--issuer", "A1",
        "--ammunition", "41",
        "--at", "2026-03-10T12:00:00-03:00",
    ])
    .output()
    .unwrap();
    assert_eq!(denied.status.code(), Some(2));

    let json: serde_json::Value = serde_json::from_str(&stdout(&denied)).unwrap();
    assert_eq!(json["evaluation"]["decision"]["rule"], "cap_exceeded");
    assert_eq!(json["evaluation"]["resolved_cap"]["source"]["by"], "role");
    let source = &json["evaluation"]["resolved_cap"]["source"];
    assert_eq!(source["key"], "Guarda Civil Municipal");
}

#[test]
fn test_rbac_listing() {
    let output = almox(&["rbac", "--group", "almoxarife"]).output().unwrap();

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.starts_with("ALMOXARIFE"));
    assert!(text.contains("almoxarifado.entregar_cautela"));
    assert!(!text.contains("desbloquear_excecao"));
}
