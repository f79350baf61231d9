//! almox-cli commands
//!
//! Each command renders its result to a string so `main` only decides where
//! it goes and which exit code to use.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};
use custody_policy::{
    ActorProfile, Authorizer, Capability, CustodyOperation, CustodyPolicy, GroupAuthorizer,
    OperationKind, PolicyEvaluator, RbacCatalog, RoleGroup,
};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// almox-cli commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the policy and print its fingerprint
    Check,

    /// Print the effective policy as YAML
    Show,

    /// Evaluate one custody operation and print the decision as JSON
    Evaluate(EvaluateArgs),

    /// Print the default role groups and their capabilities
    Rbac {
        /// Only this group (AGENTE, ALMOXARIFE, SUPERVISOR, AUDITORIA, ADMINISTRADOR)
        #[arg(short, long)]
        group: Option<RoleGroup>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Withdrawal,
    Return,
}

impl From<KindArg> for OperationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Withdrawal => OperationKind::Withdrawal,
            KindArg::Return => OperationKind::Return,
        }
    }
}

/// Flags describing the operation to evaluate
#[derive(Debug, Args)]
pub struct EvaluateArgs {
    /// Withdrawal or return
    #[arg(short, long, value_enum, default_value = "withdrawal")]
    pub kind: KindArg,

    /// Person the equipment is issued to
    #[arg(short, long)]
    pub requester: String,

    /// Requester's role (cargo)
    #[arg(long)]
    pub role: Option<String>,

    /// Requester's functional class
    #[arg(long)]
    pub class: Option<String>,

    /// Approving supervisor
    #[arg(long)]
    pub approver: Option<String>,

    /// Clerk handing over or receiving
    #[arg(long)]
    pub issuer: Option<String>,

    /// Identity checked for the window exception (defaults to issuer, then requester)
    #[arg(long)]
    pub actor: Option<String>,

    /// Operation time, RFC 3339 (defaults to now)
    #[arg(long, value_parser = parse_timestamp)]
    pub at: Option<DateTime<Utc>>,

    /// Requester's ammunition total after the operation
    #[arg(long, default_value = "0")]
    pub ammunition: u32,

    /// Requester's magazine count after the operation
    #[arg(long, default_value = "0")]
    pub magazines: u32,

    /// Group membership, as ACTOR=GROUP (repeatable)
    #[arg(long = "member", value_parser = parse_membership)]
    pub members: Vec<(String, RoleGroup)>,

    /// Direct capability grant, as ACTOR=CAPABILITY (repeatable)
    #[arg(long = "grant", value_parser = parse_grant)]
    pub grants: Vec<(String, Capability)>,
}

impl EvaluateArgs {
    fn operation(&self) -> CustodyOperation {
        let mut requester = ActorProfile::new(self.requester.as_str());
        if let Some(role) = &self.role {
            requester = requester.with_role(role);
        }
        if let Some(class) = &self.class {
            requester = requester.with_class(class);
        }

        let at = self.at.unwrap_or_else(Utc::now);
        let mut op = CustodyOperation::new(self.kind.into(), requester, at)
            .with_ammunition_total(self.ammunition)
            .with_magazines_total(self.magazines);
        if let Some(approver) = &self.approver {
            op = op.with_approver(approver.as_str());
        }
        if let Some(issuer) = &self.issuer {
            op = op.with_issuer(issuer.as_str());
        }
        if let Some(actor) = &self.actor {
            op = op.acting_as(actor.as_str());
        }
        op
    }

    fn authorizer(&self) -> GroupAuthorizer {
        let mut authorizer = GroupAuthorizer::new(RbacCatalog::bootstrap());
        for (actor, group) in &self.members {
            authorizer.assign(actor.as_str(), *group);
        }
        for (actor, capability) in &self.grants {
            authorizer.grant(actor.as_str(), capability.clone());
        }
        authorizer
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

fn split_pair(value: &str) -> Result<(&str, &str), String> {
    value
        .split_once('=')
        .filter(|(actor, rest)| !actor.is_empty() && !rest.is_empty())
        .ok_or_else(|| format!("expected ACTOR=VALUE, got {value:?}"))
}

fn parse_membership(value: &str) -> Result<(String, RoleGroup), String> {
    let (actor, group) = split_pair(value)?;
    Ok((actor.to_string(), group.parse()?))
}

fn parse_grant(value: &str) -> Result<(String, Capability), String> {
    let (actor, code) = split_pair(value)?;
    let capability = Capability::parse(code).map_err(|e| e.to_string())?;
    Ok((actor.to_string(), capability))
}

/// Result of running a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    /// Set when an evaluation was denied
    pub denied: bool,
}

impl CommandOutput {
    fn text(text: String) -> Self {
        Self { text, denied: false }
    }
}

/// Run a command against a loaded policy.
pub fn execute(command: &Command, policy: CustodyPolicy) -> anyhow::Result<CommandOutput> {
    match command {
        Command::Check => Ok(CommandOutput::text(format_check(&policy))),
        Command::Show => Ok(CommandOutput::text(
            policy.to_document().to_yaml().context("rendering policy")?,
        )),
        Command::Evaluate(args) => evaluate(args, policy),
        Command::Rbac { group } => Ok(CommandOutput::text(format_rbac(
            &RbacCatalog::bootstrap(),
            *group,
        ))),
    }
}

fn evaluate(args: &EvaluateArgs, policy: CustodyPolicy) -> anyhow::Result<CommandOutput> {
    let op = args.operation();
    let authorizer = args.authorizer();
    debug!(
        actor = %op.actor,
        groups = ?authorizer.groups_of(&op.actor).collect::<Vec<_>>(),
        unlock = authorizer.has_capability(&op.actor, policy.exception_permission()),
        "Evaluating from command line"
    );

    let evaluator = PolicyEvaluator::new(Arc::new(policy), Arc::new(authorizer));
    let evaluation = evaluator.evaluate(&op);
    let denied = !evaluation.decision.is_allowed();

    let text = serde_json::to_string_pretty(&serde_json::json!({
        "operation": op,
        "evaluation": evaluation,
    }))
    .context("rendering evaluation")?;

    Ok(CommandOutput { text, denied })
}

/// Summary printed by `check`.
pub fn format_check(policy: &CustodyPolicy) -> String {
    let limits = policy.limits();
    let mut out = String::new();

    let _ = writeln!(out, "Policy OK");
    let _ = writeln!(out, "  fingerprint:       {}", policy.fingerprint());
    let dual = if policy.dual_operation() { "on" } else { "off" };
    let _ = writeln!(out, "  dual operation:    {dual}");
    let _ = writeln!(out, "  withdrawal window: {}", policy.window(OperationKind::Withdrawal));
    let _ = writeln!(out, "  return window:     {}", policy.window(OperationKind::Return));
    let _ = writeln!(out, "  utc offset:        {}", policy.utc_offset());
    let _ = writeln!(out, "  default cap:       {}", limits.default.ammunition_total_max);
    let _ = writeln!(out, "  role caps:         {}", limits.by_role.len());
    let _ = writeln!(out, "  class caps:        {}", limits.by_class.len());
    let _ = write!(out, "  exception:         {}", policy.exception_permission());
    out
}

/// Group listing printed by `rbac`.
pub fn format_rbac(catalog: &RbacCatalog, only: Option<RoleGroup>) -> String {
    let mut out = String::new();
    for group in catalog.groups().filter(|g| only.map_or(true, |o| o == *g)) {
        let _ = writeln!(out, "{group}");
        for capability in catalog.capabilities(group) {
            let _ = writeln!(out, "  {capability}");
        }
    }
    out
}
