//! Translation Engine
//!
//! Bidirectional mapping between the unified vocabulary and each backend's
//! native one, plus validation of free-form backend parameter maps.
//!
//! | unified   | ceph      | trident        | powerstore |
//! |-----------|-----------|----------------|------------|
//! | source    | primary   | established    | Failover   |
//! | replica   | secondary | reestablished  | Reprotect  |
//! | promoting | primary*  | promoted       | Failover*  |
//! | demoting  | secondary*| reestablished* | Reprotect* |
//! | syncing   | resync    | reestablished* | Sync       |
//! | failed    | secondary*| reestablished* | Reprotect* |
//!
//! Entries marked `*` are aliases: the reverse lookup yields a different
//! unified state. Both directions are exhaustive matches, so every native
//! value has exactly one unified equivalent.

use crate::crd::{ReplicationMode, ReplicationState};
use crate::domain::Backend;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Native State Vocabularies
// =============================================================================

/// csi-addons `spec.replicationState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CephState {
    Primary,
    Secondary,
    Resync,
}

/// Trident `spec.state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TridentState {
    Established,
    Reestablished,
    Promoted,
}

/// Dell replication group `spec.action`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerStoreAction {
    Failover,
    Sync,
    Reprotect,
}

/// A backend-native state value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeState {
    Ceph(CephState),
    Trident(TridentState),
    PowerStore(PowerStoreAction),
}

impl NativeState {
    pub fn backend(&self) -> Backend {
        match self {
            NativeState::Ceph(_) => Backend::Ceph,
            NativeState::Trident(_) => Backend::Trident,
            NativeState::PowerStore(_) => Backend::PowerStore,
        }
    }

    /// Exact string the backend API accepts
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeState::Ceph(CephState::Primary) => "primary",
            NativeState::Ceph(CephState::Secondary) => "secondary",
            NativeState::Ceph(CephState::Resync) => "resync",
            NativeState::Trident(TridentState::Established) => "established",
            NativeState::Trident(TridentState::Reestablished) => "reestablished",
            NativeState::Trident(TridentState::Promoted) => "promoted",
            NativeState::PowerStore(PowerStoreAction::Failover) => "Failover",
            NativeState::PowerStore(PowerStoreAction::Sync) => "Sync",
            NativeState::PowerStore(PowerStoreAction::Reprotect) => "Reprotect",
        }
    }

    /// Every value a backend can report
    pub fn values(backend: Backend) -> Vec<NativeState> {
        match backend {
            Backend::Ceph => vec![
                NativeState::Ceph(CephState::Primary),
                NativeState::Ceph(CephState::Secondary),
                NativeState::Ceph(CephState::Resync),
            ],
            Backend::Trident => vec![
                NativeState::Trident(TridentState::Established),
                NativeState::Trident(TridentState::Reestablished),
                NativeState::Trident(TridentState::Promoted),
            ],
            Backend::PowerStore => vec![
                NativeState::PowerStore(PowerStoreAction::Failover),
                NativeState::PowerStore(PowerStoreAction::Sync),
                NativeState::PowerStore(PowerStoreAction::Reprotect),
            ],
        }
    }

    /// Parse a value reported by `backend`, case-insensitively
    pub fn parse(backend: Backend, value: &str) -> Result<NativeState> {
        let wanted = value.trim();
        Self::values(backend)
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::UnknownBackendValue {
                backend,
                value: value.to_string(),
            })
    }
}

impl std::fmt::Display for NativeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Native Mode Vocabularies
// =============================================================================

/// A backend-native replication mode value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeMode {
    /// RBD mirroring mode
    CephMirroring(&'static str),
    /// ONTAP SnapMirror policy
    TridentPolicy(&'static str),
    /// PowerStore replication mode
    PowerStoreMode(&'static str),
}

impl NativeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeMode::CephMirroring(s) | NativeMode::TridentPolicy(s) | NativeMode::PowerStoreMode(s) => s,
        }
    }
}

pub const CEPH_MIRRORING_MODES: &[&str] = &["journal", "snapshot"];
pub const TRIDENT_POLICIES: &[&str] = &["MirrorAllSnapshots", "MirrorAndVault", "Sync", "StrictSync"];
pub const POWERSTORE_RPOS: &[(&str, u64)] = &[
    ("Zero", 0),
    ("Five_Minutes", 300),
    ("Fifteen_Minutes", 900),
    ("Thirty_Minutes", 1800),
    ("One_Hour", 3600),
    ("Six_Hours", 21600),
    ("Twelve_Hours", 43200),
    ("One_Day", 86400),
];

// =============================================================================
// Translation Engine
// =============================================================================

/// Stateless translator between unified and native vocabularies
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationEngine;

impl TranslationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Forward translation of state and mode
    pub fn to_backend(
        &self,
        state: ReplicationState,
        mode: ReplicationMode,
        backend: Backend,
    ) -> Result<(NativeState, NativeMode)> {
        Ok((self.state_to_backend(state, backend), self.mode_to_backend(mode, backend)?))
    }

    /// Forward translation of a state alone
    pub fn state_to_backend(&self, state: ReplicationState, backend: Backend) -> NativeState {
        use ReplicationState::*;

        match backend {
            Backend::Ceph => NativeState::Ceph(match state {
                Source | Promoting => CephState::Primary,
                Syncing => CephState::Resync,
                Replica | Demoting | Failed => CephState::Secondary,
            }),
            Backend::Trident => NativeState::Trident(match state {
                Source => TridentState::Established,
                Promoting => TridentState::Promoted,
                Replica | Demoting | Syncing | Failed => TridentState::Reestablished,
            }),
            Backend::PowerStore => NativeState::PowerStore(match state {
                Source | Promoting => PowerStoreAction::Failover,
                Syncing => PowerStoreAction::Sync,
                Replica | Demoting | Failed => PowerStoreAction::Reprotect,
            }),
        }
    }

    /// Value written when nothing more specific applies: the replica side,
    /// which never accepts writes
    pub fn safe_default(&self, backend: Backend) -> NativeState {
        self.state_to_backend(ReplicationState::Replica, backend)
    }

    /// Forward translation of a mode
    pub fn mode_to_backend(&self, mode: ReplicationMode, backend: Backend) -> Result<NativeMode> {
        use ReplicationMode::*;

        match backend {
            Backend::Ceph => match mode {
                Synchronous => Err(Error::UnsupportedMode {
                    backend,
                    mode: mode.to_string(),
                }),
                Continuous => Ok(NativeMode::CephMirroring("journal")),
                Asynchronous | Interval | Eventual => Ok(NativeMode::CephMirroring("snapshot")),
            },
            Backend::Trident => Ok(NativeMode::TridentPolicy(match mode {
                Synchronous => "Sync",
                _ => "MirrorAllSnapshots",
            })),
            Backend::PowerStore => Ok(NativeMode::PowerStoreMode(match mode {
                Synchronous => "SYNC",
                Continuous => "METRO",
                _ => "ASYNC",
            })),
        }
    }

    /// Reverse translation; total over every native value
    pub fn from_backend(&self, native: NativeState) -> ReplicationState {
        use ReplicationState::*;

        match native {
            NativeState::Ceph(CephState::Primary) => Source,
            NativeState::Ceph(CephState::Secondary) => Replica,
            NativeState::Ceph(CephState::Resync) => Syncing,
            NativeState::Trident(TridentState::Established) => Source,
            NativeState::Trident(TridentState::Reestablished) => Replica,
            NativeState::Trident(TridentState::Promoted) => Promoting,
            NativeState::PowerStore(PowerStoreAction::Failover) => Source,
            NativeState::PowerStore(PowerStoreAction::Sync) => Syncing,
            NativeState::PowerStore(PowerStoreAction::Reprotect) => Replica,
        }
    }

    /// Parse and reverse-translate a reported string
    pub fn from_backend_str(&self, backend: Backend, value: &str) -> Result<ReplicationState> {
        NativeState::parse(backend, value).map(|native| self.from_backend(native))
    }

    /// Unified states whose forward value reverses to another state
    pub fn aliases(&self, backend: Backend) -> Vec<ReplicationState> {
        ReplicationState::ALL
            .into_iter()
            .filter(|s| self.from_backend(self.state_to_backend(*s, backend)) != *s)
            .collect()
    }

    // =========================================================================
    // Parameter Validation
    // =========================================================================

    /// Validate a free-form parameter map for `backend`. Unknown keys pass
    /// through; known keys must carry a value the backend accepts.
    pub fn validate_parameters(&self, backend: Backend, params: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in params {
            let invalid = |reason: String| Error::InvalidParameter {
                backend,
                key: key.clone(),
                value: value.clone(),
                reason,
            };

            match (backend, key.as_str()) {
                (Backend::Ceph, "mirroringMode") => {
                    if !CEPH_MIRRORING_MODES.contains(&value.as_str()) {
                        return Err(invalid(format!(
                            "unknown mirroring mode, expected one of {:?}",
                            CEPH_MIRRORING_MODES
                        )));
                    }
                }
                (Backend::Ceph, "schedulingInterval") => {
                    if parse_duration_secs(value).is_none() {
                        return Err(invalid("expected a duration such as 5m, 1h or 1d".into()));
                    }
                }
                (Backend::Ceph, "autoResync") => {
                    if value.parse::<bool>().is_err() {
                        return Err(invalid("expected true or false".into()));
                    }
                }
                (Backend::Trident, "replicationPolicy") => {
                    if !TRIDENT_POLICIES.contains(&value.as_str()) {
                        return Err(invalid(format!(
                            "unknown replication policy, expected one of {:?}",
                            TRIDENT_POLICIES
                        )));
                    }
                }
                (Backend::Trident, "replicationSchedule")
                | (Backend::PowerStore, "protectionPolicy")
                | (Backend::PowerStore, "remoteSystem")
                | (Backend::PowerStore, "remoteClusterId") => {
                    if value.trim().is_empty() {
                        return Err(invalid("must not be empty".into()));
                    }
                }
                (Backend::PowerStore, "rpo") => {
                    powerstore_rpo(value).map_err(|_| invalid(rpo_reason()))?;
                }
                _ => debug!("Passing through {} parameter {}={}", backend, key, value),
            }
        }
        Ok(())
    }
}

fn rpo_reason() -> String {
    let names: Vec<&str> = POWERSTORE_RPOS.iter().map(|(n, _)| *n).collect();
    format!("unsupported RPO, expected one of {:?} or a matching duration", names)
}

/// Map an RPO name or duration string onto PowerStore's RPO enumeration
pub fn powerstore_rpo(value: &str) -> Result<&'static str> {
    if let Some((name, _)) = POWERSTORE_RPOS.iter().find(|(n, _)| *n == value) {
        return Ok(name);
    }
    parse_duration_secs(value)
        .and_then(|secs| POWERSTORE_RPOS.iter().find(|(_, s)| *s == secs))
        .map(|(name, _)| *name)
        .ok_or_else(|| Error::InvalidParameter {
            backend: Backend::PowerStore,
            key: "rpo".into(),
            value: value.to_string(),
            reason: rpo_reason(),
        })
}

/// Parse `30s`, `5m`, `1h`, `1d` (or a bare number of seconds)
pub fn parse_duration_secs(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, "s"),
    };
    let n: u64 = digits.parse().ok()?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    n.checked_mul(multiplier)
}
