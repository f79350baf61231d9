//! Default role groups for the almoxarifado and the capabilities each one
//! receives when the permission catalog is bootstrapped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, warn};

use crate::authz::{Authorizer, Capability, StaticAuthorizer};
use crate::types::ActorId;

/// Every capability the almoxarifado app defines.
pub const APP_CAPABILITIES: &[&str] = &[
    "almoxarifado.view_bempatrimonial",
    "almoxarifado.add_bempatrimonial",
    "almoxarifado.change_bempatrimonial",
    "almoxarifado.view_movimentacaocautela",
    "almoxarifado.add_movimentacaocautela",
    "almoxarifado.change_movimentacaocautela",
    "almoxarifado.view_cautelapermanente",
    "almoxarifado.add_cautelapermanente",
    "almoxarifado.view_movimentacaoestoque",
    "almoxarifado.add_movimentacaoestoque",
    "almoxarifado.change_movimentacaoestoque",
    "almoxarifado.movimentar_estoque",
    "almoxarifado.ver_livro_municao",
    "almoxarifado.gerir_assignacoes_fixas",
    "almoxarifado.verificacao_periodica",
    "almoxarifado.aprovar_cautela",
    "almoxarifado.entregar_cautela",
    "almoxarifado.devolver_cautela",
    "almoxarifado.desbloquear_excecao",
    "almoxarifado.ver_auditoria",
];

/// Default permission groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleGroup {
    /// Field agent: read-only view of assets and movements
    Agente,
    /// Armory clerk: issues and receives custody, moves stock
    Almoxarife,
    /// Approves custody and unlocks exceptions
    Supervisor,
    /// Read-only audit access
    Auditoria,
    /// Everything in the app
    Administrador,
}

enum Grants {
    Listed(&'static [&'static str]),
    AllAppCapabilities,
}

impl RoleGroup {
    pub const ALL: [RoleGroup; 5] = [
        Self::Agente,
        Self::Almoxarife,
        Self::Supervisor,
        Self::Auditoria,
        Self::Administrador,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agente => "AGENTE",
            Self::Almoxarife => "ALMOXARIFE",
            Self::Supervisor => "SUPERVISOR",
            Self::Auditoria => "AUDITORIA",
            Self::Administrador => "ADMINISTRADOR",
        }
    }

    fn grants(self) -> Grants {
        match self {
            Self::Agente => Grants::Listed(&[
                "view_bempatrimonial",
                "view_movimentacaocautela",
                "view_cautelapermanente",
            ]),
            Self::Almoxarife => Grants::Listed(&[
                "view_bempatrimonial",
                "view_movimentacaocautela",
                "add_movimentacaocautela",
                "change_movimentacaocautela",
                "entregar_cautela",
                "devolver_cautela",
                "view_movimentacaoestoque",
                "add_movimentacaoestoque",
                "change_movimentacaoestoque",
                "movimentar_estoque",
            ]),
            Self::Supervisor => Grants::Listed(&[
                "view_bempatrimonial",
                "view_movimentacaocautela",
                "view_movimentacaoestoque",
                "view_cautelapermanente",
                "aprovar_cautela",
                "desbloquear_excecao",
            ]),
            Self::Auditoria => Grants::Listed(&[
                "view_bempatrimonial",
                "view_movimentacaocautela",
                "view_movimentacaoestoque",
                "view_cautelapermanente",
                "ver_livro_municao",
                "ver_auditoria",
            ]),
            Self::Administrador => Grants::AllAppCapabilities,
        }
    }
}

impl fmt::Display for RoleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoleGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown role group: {s}"))
    }
}

/// Group → capability assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RbacCatalog {
    groups: BTreeMap<RoleGroup, BTreeSet<Capability>>,
}

impl RbacCatalog {
    /// Build the default catalog.
    ///
    /// Codes that are malformed or not defined by the app are skipped with a
    /// warning, so a group never receives a capability that does not exist.
    pub fn bootstrap() -> Self {
        let known: BTreeSet<Capability> = APP_CAPABILITIES
            .iter()
            .filter_map(|code| Capability::parse(code).ok())
            .collect();

        let mut groups = BTreeMap::new();
        for group in RoleGroup::ALL {
            let assigned: BTreeSet<Capability> = match group.grants() {
                Grants::AllAppCapabilities => known.clone(),
                Grants::Listed(codes) => codes
                    .iter()
                    .filter_map(|code| match Capability::parse(code) {
                        Ok(cap) if known.contains(&cap) => Some(cap),
                        _ => {
                            warn!(group = %group, code = %code, "Capability not found, skipping");
                            None
                        }
                    })
                    .collect(),
            };
            debug!(group = %group, count = assigned.len(), "Bootstrapped role group");
            groups.insert(group, assigned);
        }

        Self { groups }
    }

    /// Capabilities assigned to a group.
    pub fn capabilities(&self, group: RoleGroup) -> impl Iterator<Item = &Capability> {
        self.groups.get(&group).into_iter().flatten()
    }

    /// Whether a group holds a capability.
    pub fn grants(&self, group: RoleGroup, capability: &Capability) -> bool {
        self.groups
            .get(&group)
            .is_some_and(|caps| caps.contains(capability))
    }

    /// Groups in catalog order.
    pub fn groups(&self) -> impl Iterator<Item = RoleGroup> + '_ {
        self.groups.keys().copied()
    }
}

impl Default for RbacCatalog {
    fn default() -> Self {
        Self::bootstrap()
    }
}

/// Resolves capabilities through group membership, plus optional direct grants.
#[derive(Debug, Clone, Default)]
pub struct GroupAuthorizer {
    catalog: RbacCatalog,
    memberships: HashMap<ActorId, BTreeSet<RoleGroup>>,
    direct: StaticAuthorizer,
}

impl GroupAuthorizer {
    pub fn new(catalog: RbacCatalog) -> Self {
        Self {
            catalog,
            memberships: HashMap::new(),
            direct: StaticAuthorizer::new(),
        }
    }

    /// Add an actor to a group.
    pub fn assign(&mut self, actor: impl Into<ActorId>, group: RoleGroup) {
        self.memberships.entry(actor.into()).or_default().insert(group);
    }

    /// Builder form of [`assign`](Self::assign).
    pub fn with_member(mut self, actor: impl Into<ActorId>, group: RoleGroup) -> Self {
        self.assign(actor, group);
        self
    }

    /// Grant a capability outside any group.
    pub fn grant(&mut self, actor: impl Into<ActorId>, capability: Capability) {
        self.direct.grant(actor, capability);
    }

    /// Groups an actor belongs to.
    pub fn groups_of(&self, actor: &ActorId) -> impl Iterator<Item = RoleGroup> + '_ {
        self.memberships.get(actor).into_iter().flatten().copied()
    }

    pub fn catalog(&self) -> &RbacCatalog {
        &self.catalog
    }
}

impl Authorizer for GroupAuthorizer {
    fn has_capability(&self, actor: &ActorId, capability: &Capability) -> bool {
        self.direct.has_capability(actor, capability)
            || self
                .groups_of(actor)
                .any(|group| self.catalog.grants(group, capability))
    }
}
