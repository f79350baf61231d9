//! Policy documents and the validated, immutable [`CustodyPolicy`].
//!
//! Documents keep the key names operators already use (`dupla_operacao`,
//! `horarios`, `limites`, `permissao_excecao`). Everything is checked once in
//! [`PolicyDocument::into_policy`]; a malformed document never reaches the
//! evaluator.

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

use crate::authz::{Capability, EXCEPTION_CAPABILITY};
use crate::limits::QuantityLimits;
use crate::types::OperationKind;
use crate::window::{digits, format_clock, parse_clock, TimeWindow};

/// Environment variables that override document values.
pub const ENV_WITHDRAWAL_START: &str = "ALMOX_RETIRADA_INICIO";
pub const ENV_WITHDRAWAL_END: &str = "ALMOX_RETIRADA_FIM";
pub const ENV_RETURN_START: &str = "ALMOX_DEVOLUCAO_INICIO";
pub const ENV_RETURN_END: &str = "ALMOX_DEVOLUCAO_FIM";
pub const ENV_AMMUNITION_TOTAL_MAX: &str = "ALMOX_MUNICAO_TOTAL_MAX";

/// Institutional offset (America/Sao_Paulo, no DST).
pub const DEFAULT_UTC_OFFSET: &str = "-03:00";

/// Error types for loading a policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Policy file could not be read
    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid YAML or has missing/unknown fields
    #[error("Malformed policy document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Clock string is not `HH:MM`
    #[error("Invalid clock time for {field}: {value:?} (expected HH:MM)")]
    InvalidClock { field: &'static str, value: String },

    /// Window starts after it ends
    #[error("The {kind} window starts after it ends ({start} > {end})")]
    InvertedWindow {
        kind: OperationKind,
        start: String,
        end: String,
    },

    /// Default ammunition cap is zero
    #[error("limites.default.municao_total_max must be greater than zero")]
    ZeroDefaultCap,

    /// Capability code is malformed
    #[error("Invalid capability identifier: {0:?}")]
    InvalidCapability(String),

    /// UTC offset is malformed
    #[error("Invalid UTC offset: {0:?} (expected +HH:MM or -HH:MM)")]
    InvalidOffset(String),

    /// Environment override could not be applied
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Clock windows as written in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HoursDocument {
    #[serde(rename = "retirada_inicio", default = "default_window_start")]
    pub withdrawal_start: String,
    #[serde(rename = "retirada_fim", default = "default_window_end")]
    pub withdrawal_end: String,
    #[serde(rename = "devolucao_inicio", default = "default_window_start")]
    pub return_start: String,
    #[serde(rename = "devolucao_fim", default = "default_window_end")]
    pub return_end: String,
}

impl Default for HoursDocument {
    fn default() -> Self {
        Self {
            withdrawal_start: default_window_start(),
            withdrawal_end: default_window_end(),
            return_start: default_window_start(),
            return_end: default_window_end(),
        }
    }
}

/// Policy exactly as configured, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Enables the dual-control gate
    #[serde(rename = "dupla_operacao", default = "default_true")]
    pub dual_operation: bool,
    /// Withdrawal and return windows
    #[serde(rename = "horarios", default)]
    pub hours: HoursDocument,
    /// Quantity caps
    #[serde(rename = "limites", default)]
    pub limits: QuantityLimits,
    /// Capability that overrides the windows
    #[serde(rename = "permissao_excecao", default = "default_exception_permission")]
    pub exception_permission: String,
    /// Offset used to read operation timestamps as local clock time
    #[serde(rename = "fuso_horario", default = "default_utc_offset")]
    pub utc_offset: String,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            dual_operation: true,
            hours: HoursDocument::default(),
            limits: QuantityLimits::default(),
            exception_permission: default_exception_permission(),
            utc_offset: default_utc_offset(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_window_start() -> String {
    "07:00".to_string()
}
fn default_window_end() -> String {
    "22:00".to_string()
}
fn default_exception_permission() -> String {
    EXCEPTION_CAPABILITY.to_string()
}
fn default_utc_offset() -> String {
    DEFAULT_UTC_OFFSET.to_string()
}

impl PolicyDocument {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply `ALMOX_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let clocks = [
            (ENV_WITHDRAWAL_START, &mut self.hours.withdrawal_start),
            (ENV_WITHDRAWAL_END, &mut self.hours.withdrawal_end),
            (ENV_RETURN_START, &mut self.hours.return_start),
            (ENV_RETURN_END, &mut self.hours.return_end),
        ];
        for (var, slot) in clocks {
            if let Some(value) = lookup(var) {
                debug!(var, value = %value, "Applying policy override");
                *slot = value;
            }
        }

        if let Some(value) = lookup(ENV_AMMUNITION_TOTAL_MAX) {
            let total = digits(value.trim()).ok_or_else(|| PolicyError::InvalidEnv {
                var: ENV_AMMUNITION_TOTAL_MAX,
                value: value.clone(),
            })?;
            debug!(var = ENV_AMMUNITION_TOTAL_MAX, total, "Applying policy override");
            self.limits.default.ammunition_total_max = total;
        }

        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|var| std::env::var(var).ok())
    }

    /// Validate and freeze the document.
    pub fn into_policy(self) -> Result<CustodyPolicy> {
        let withdrawal_window = window(
            OperationKind::Withdrawal,
            ("horarios.retirada_inicio", &self.hours.withdrawal_start),
            ("horarios.retirada_fim", &self.hours.withdrawal_end),
        )?;
        let return_window = window(
            OperationKind::Return,
            ("horarios.devolucao_inicio", &self.hours.return_start),
            ("horarios.devolucao_fim", &self.hours.return_end),
        )?;

        if self.limits.default.ammunition_total_max == 0 {
            return Err(PolicyError::ZeroDefaultCap);
        }

        let exception_permission = Capability::parse(&self.exception_permission)?;
        let utc_offset = parse_utc_offset(&self.utc_offset)
            .ok_or_else(|| PolicyError::InvalidOffset(self.utc_offset.clone()))?;

        Ok(CustodyPolicy::assemble(
            self.dual_operation,
            withdrawal_window,
            return_window,
            self.limits,
            exception_permission,
            utc_offset,
        ))
    }
}

fn window(
    kind: OperationKind,
    start: (&'static str, &str),
    end: (&'static str, &str),
) -> Result<TimeWindow> {
    let clock = |(field, value): (&'static str, &str)| {
        parse_clock(value).ok_or_else(|| PolicyError::InvalidClock {
            field,
            value: value.to_string(),
        })
    };
    let (start, end) = (clock(start)?, clock(end)?);

    TimeWindow::new(start, end).ok_or_else(|| PolicyError::InvertedWindow {
        kind,
        start: format_clock(start),
        end: format_clock(end),
    })
}

/// Parse `+HH:MM` / `-HH:MM` (or `UTC`/`Z`).
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return Some(Utc.fix());
    }

    let sign = match value.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let (hours, minutes) = value[1..].split_once(':')?;
    let hours = i32::try_from(digits(hours)?).ok()?;
    let minutes = i32::try_from(digits(minutes)?).ok()?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn format_utc_offset(offset: FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    let sign = if seconds < 0 { '-' } else { '+' };
    let seconds = seconds.abs();
    format!("{sign}{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60)
}

/// Validated custody policy. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyPolicy {
    dual_operation: bool,
    withdrawal_window: TimeWindow,
    return_window: TimeWindow,
    limits: QuantityLimits,
    exception_permission: Capability,
    utc_offset: FixedOffset,
    fingerprint: String,
}

impl CustodyPolicy {
    fn assemble(
        dual_operation: bool,
        withdrawal_window: TimeWindow,
        return_window: TimeWindow,
        limits: QuantityLimits,
        exception_permission: Capability,
        utc_offset: FixedOffset,
    ) -> Self {
        let mut policy = Self {
            dual_operation,
            withdrawal_window,
            return_window,
            limits,
            exception_permission,
            utc_offset,
            fingerprint: String::new(),
        };
        policy.fingerprint = fingerprint_document(&policy.to_document());
        policy
    }

    /// Parse and validate a YAML document, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        PolicyDocument::from_yaml(yaml)?.into_policy()
    }

    /// Read a policy file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut document = PolicyDocument::from_yaml(&raw)?;
        document.apply_process_env()?;
        let policy = document.into_policy()?;

        info!(
            path = %path.display(),
            fingerprint = %policy.fingerprint,
            "Loaded custody policy"
        );
        Ok(policy)
    }

    /// Built-in defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut document = PolicyDocument::default();
        document.apply_process_env()?;
        document.into_policy()
    }

    /// Render back to a document.
    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            dual_operation: self.dual_operation,
            hours: HoursDocument {
                withdrawal_start: format_clock(self.withdrawal_window.start()),
                withdrawal_end: format_clock(self.withdrawal_window.end()),
                return_start: format_clock(self.return_window.start()),
                return_end: format_clock(self.return_window.end()),
            },
            limits: self.limits.clone(),
            exception_permission: self.exception_permission.to_string(),
            utc_offset: format_utc_offset(self.utc_offset),
        }
    }

    pub fn dual_operation(&self) -> bool {
        self.dual_operation
    }

    /// Window that applies to an operation kind.
    pub fn window(&self, kind: OperationKind) -> &TimeWindow {
        match kind {
            OperationKind::Withdrawal => &self.withdrawal_window,
            OperationKind::Return => &self.return_window,
        }
    }

    pub fn limits(&self) -> &QuantityLimits {
        &self.limits
    }

    pub fn exception_permission(&self) -> &Capability {
        &self.exception_permission
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Local clock time of an instant, in the institutional offset.
    pub fn local_time(&self, at: DateTime<Utc>) -> NaiveTime {
        at.with_timezone(&self.utc_offset).time()
    }

    /// SHA-256 of the canonical document, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Default for CustodyPolicy {
    fn default() -> Self {
        let start = NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN);
        let end = NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN);
        let hours = TimeWindow::from_ordered(start, end);

        Self::assemble(
            true,
            hours,
            hours,
            QuantityLimits::default(),
            Capability::exception_default(),
            parse_utc_offset(DEFAULT_UTC_OFFSET).unwrap_or_else(|| Utc.fix()),
        )
    }
}

fn fingerprint_document(document: &PolicyDocument) -> String {
    let canonical = serde_json::to_vec(document).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}
