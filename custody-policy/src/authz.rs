//! Capability identifiers and the authorization interface the evaluator
//! depends on.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::config::PolicyError;
use crate::types::ActorId;

/// App label assumed for capability codes written without one.
pub const DEFAULT_APP: &str = "almoxarifado";

/// Capability that unlocks operations outside the time windows.
pub const EXCEPTION_CAPABILITY: &str = "almoxarifado.desbloquear_excecao";

/// A permission code in `app.codename` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    /// Parse a capability code. A bare codename is placed under [`DEFAULT_APP`].
    pub fn parse(code: &str) -> Result<Self, PolicyError> {
        let code = code.trim();
        let (app, codename) = code.split_once('.').unwrap_or((DEFAULT_APP, code));

        if !is_identifier(app) || !is_identifier(codename) {
            return Err(PolicyError::InvalidCapability(code.to_string()));
        }

        Ok(Self(format!("{app}.{codename}")))
    }

    /// The built-in window exception capability.
    pub fn exception_default() -> Self {
        Self(EXCEPTION_CAPABILITY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// App label part.
    pub fn app(&self) -> &str {
        self.0.split_once('.').map(|(app, _)| app).unwrap_or(DEFAULT_APP)
    }

    /// Codename part.
    pub fn codename(&self) -> &str {
        self.0.split_once('.').map(|(_, name)| name).unwrap_or(&self.0)
    }
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Capability {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.0
    }
}

/// Answers "does this actor hold capability X".
///
/// Implemented by whatever owns identities and permissions; the evaluator
/// only ever asks through this trait.
pub trait Authorizer: Send + Sync {
    fn has_capability(&self, actor: &ActorId, capability: &Capability) -> bool;
}

/// Grants nothing to anyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn has_capability(&self, _actor: &ActorId, _capability: &Capability) -> bool {
        false
    }
}

/// Fixed per-actor grants.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    grants: HashMap<ActorId, HashSet<Capability>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a capability to an actor.
    pub fn grant(&mut self, actor: impl Into<ActorId>, capability: Capability) {
        self.grants.entry(actor.into()).or_default().insert(capability);
    }

    /// Builder form of [`grant`](Self::grant).
    pub fn with_grant(mut self, actor: impl Into<ActorId>, capability: Capability) -> Self {
        self.grant(actor, capability);
        self
    }

    /// Remove every grant held by an actor.
    pub fn revoke_all(&mut self, actor: &ActorId) {
        self.grants.remove(actor);
    }
}

impl Authorizer for StaticAuthorizer {
    fn has_capability(&self, actor: &ActorId, capability: &Capability) -> bool {
        self.grants
            .get(actor)
            .is_some_and(|caps| caps.contains(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capability() {
        let cap = Capability::parse("almoxarifado.desbloquear_excecao").unwrap();
        assert_eq!(cap.app(), "almoxarifado");
        assert_eq!(cap.codename(), "desbloquear_excecao");

        let bare = Capability::parse("aprovar_cautela").unwrap();
        assert_eq!(bare.as_str(), "almoxarifado.aprovar_cautela");

        assert!(Capability::parse("").is_err());
        assert!(Capability::parse("almoxarifado.").is_err());
        assert!(Capability::parse("Almox.Thing").is_err());
        assert!(Capability::parse("a.b.c").is_err());
    }

    #[test]
    fn test_capability_serde() {
        let cap: Capability = serde_json::from_str("\"ver_auditoria\"").unwrap();
        assert_eq!(cap.as_str(), "almoxarifado.ver_auditoria");
        assert!(serde_json::from_str::<Capability>("\"not valid\"").is_err());
    }

    #[test]
    fn test_static_authorizer() {
        let unlock = Capability::parse(EXCEPTION_CAPABILITY).unwrap();
        let mut authz = StaticAuthorizer::new().with_grant("S1", unlock.clone());

        assert!(authz.has_capability(&ActorId::new("S1"), &unlock));
        assert!(!authz.has_capability(&ActorId::new("U1"), &unlock));
        assert!(!DenyAll.has_capability(&ActorId::new("S1"), &unlock));

        authz.revoke_all(&ActorId::new("S1"));
        assert!(!authz.has_capability(&ActorId::new("S1"), &unlock));
    }
}
