//! Quantity caps by role, functional class and global default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::ActorProfile;

/// Default ceiling on the ammunition an individual may hold.
pub const DEFAULT_AMMUNITION_TOTAL_MAX: u32 = 60;

/// Cap fields for one role, class or the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapLimits {
    /// Maximum rounds of ammunition held at once
    #[serde(rename = "municao_total_max")]
    pub ammunition_total_max: u32,
    /// Maximum magazines held at once, when capped
    #[serde(
        rename = "carregadores_max",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub magazines_max: Option<u32>,
}

impl CapLimits {
    /// Cap on ammunition only.
    pub const fn ammunition(total: u32) -> Self {
        Self {
            ammunition_total_max: total,
            magazines_max: None,
        }
    }

    /// Builder: also cap magazines.
    pub const fn with_magazines(mut self, max: u32) -> Self {
        self.magazines_max = Some(max);
        self
    }
}

impl Default for CapLimits {
    fn default() -> Self {
        Self::ammunition(DEFAULT_AMMUNITION_TOTAL_MAX)
    }
}

/// Where a resolved cap came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "key", rename_all = "snake_case")]
pub enum CapSource {
    Role(String),
    Class(String),
    Default,
}

impl fmt::Display for CapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role(role) => write!(f, "role '{role}'"),
            Self::Class(class) => write!(f, "class '{class}'"),
            Self::Default => f.write_str("the default limit"),
        }
    }
}

/// The cap that applies to a requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCap {
    pub limits: CapLimits,
    pub source: CapSource,
}

/// Cap tables as configured under `limites`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantityLimits {
    /// Caps keyed by role (cargo)
    #[serde(rename = "por_cargo", default)]
    pub by_role: BTreeMap<String, CapLimits>,
    /// Caps keyed by functional class code
    #[serde(rename = "por_classe", default)]
    pub by_class: BTreeMap<String, CapLimits>,
    /// Fallback when neither role nor class matches
    #[serde(default)]
    pub default: CapLimits,
}

impl Default for QuantityLimits {
    fn default() -> Self {
        Self {
            by_role: BTreeMap::new(),
            by_class: BTreeMap::new(),
            default: CapLimits::default(),
        }
    }
}

impl QuantityLimits {
    /// Builder: add a role cap.
    pub fn with_role(mut self, role: impl Into<String>, limits: CapLimits) -> Self {
        self.by_role.insert(role.into(), limits);
        self
    }

    /// Builder: add a class cap.
    pub fn with_class(mut self, class: impl Into<String>, limits: CapLimits) -> Self {
        self.by_class.insert(class.into(), limits);
        self
    }

    /// Resolve the cap for a requester: role first, then class, then default.
    ///
    /// A matching entry with a zero ammunition cap counts as unset and yields
    /// the default, without falling through to the next table.
    pub fn resolve(&self, profile: &ActorProfile) -> ResolvedCap {
        if let Some(role) = profile.role.as_deref().filter(|r| !r.is_empty()) {
            if let Some(limits) = self.by_role.get(role) {
                return self.matched(*limits, CapSource::Role(role.to_string()));
            }
        }

        if let Some(class) = profile.class.as_deref().filter(|c| !c.is_empty()) {
            if let Some(limits) = self.by_class.get(class) {
                return self.matched(*limits, CapSource::Class(class.to_string()));
            }
        }

        self.fallback()
    }

    fn matched(&self, limits: CapLimits, source: CapSource) -> ResolvedCap {
        if limits.ammunition_total_max == 0 {
            return self.fallback();
        }
        ResolvedCap { limits, source }
    }

    fn fallback(&self) -> ResolvedCap {
        ResolvedCap {
            limits: self.default,
            source: CapSource::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> QuantityLimits {
        QuantityLimits::default()
            .with_role("Guarda Civil Municipal", CapLimits::ammunition(40).with_magazines(2))
            .with_class("3C", CapLimits::ammunition(60))
            .with_class("1A", CapLimits::ammunition(90))
    }

    #[test]
    fn test_role_takes_precedence_over_class() {
        let profile = ActorProfile::new("U1")
            .with_role("Guarda Civil Municipal")
            .with_class("3C");

        let resolved = limits().resolve(&profile);
        assert_eq!(resolved.limits.ammunition_total_max, 40);
        assert_eq!(resolved.limits.magazines_max, Some(2));
        assert_eq!(resolved.source, CapSource::Role("Guarda Civil Municipal".into()));
    }

    #[test]
    fn test_class_when_role_unmatched() {
        let profile = ActorProfile::new("U1").with_role("Inspetor").with_class("1A");

        let resolved = limits().resolve(&profile);
        assert_eq!(resolved.limits.ammunition_total_max, 90);
        assert_eq!(resolved.source, CapSource::Class("1A".into()));
    }

    #[test]
    fn test_default_when_nothing_matches() {
        let resolved = limits().resolve(&ActorProfile::new("U1").with_class("2B"));
        assert_eq!(resolved.limits.ammunition_total_max, DEFAULT_AMMUNITION_TOTAL_MAX);
        assert_eq!(resolved.source, CapSource::Default);
    }

    #[test]
    fn test_zero_entry_falls_back_to_default() {
        let limits = QuantityLimits::default()
            .with_role("Inspetor", CapLimits::ammunition(0))
            .with_class("3C", CapLimits::ammunition(30));
        let profile = ActorProfile::new("U1").with_role("Inspetor").with_class("3C");

        let resolved = limits.resolve(&profile);
        assert_eq!(resolved.source, CapSource::Default);
        assert_eq!(resolved.limits.ammunition_total_max, 60);
    }

    #[test]
    fn test_empty_role_is_ignored() {
        let limits = QuantityLimits::default().with_role("", CapLimits::ammunition(5));
        let resolved = limits.resolve(&ActorProfile::new("U1").with_role(""));
        assert_eq!(resolved.source, CapSource::Default);
    }
}
