use std::collections::BTreeMap;

use serde::Serialize;

/// Risk tier of a catalog action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One permitted action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionInfo {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub risk: RiskLevel,
    /// Whether the action may run without a human approving it first.
    pub auto_approve: bool,
}

/// Action id used for one-shot installer execution.
pub const INSTALL_SOFTWARE: &str = "install_software";

const BUILTIN: &[ActionInfo] = &[
    ActionInfo {
        id: "flush_dns",
        label: "Flush DNS cache",
        description: "Clears the operating system's DNS resolver cache.",
        risk: RiskLevel::Low,
        auto_approve: true,
    },
    ActionInfo {
        id: "clear_temp_files",
        label: "Clear temporary files",
        description: "Deletes stale files from the system temporary directory.",
        risk: RiskLevel::Low,
        auto_approve: true,
    },
    ActionInfo {
        id: "restart_service",
        label: "Restart service",
        description: "Restarts one service from the supported service list.",
        risk: RiskLevel::Medium,
        auto_approve: false,
    },
    ActionInfo {
        id: "kill_process",
        label: "Terminate process",
        description: "Forcibly terminates a non-protected process by id.",
        risk: RiskLevel::High,
        auto_approve: false,
    },
    ActionInfo {
        id: INSTALL_SOFTWARE,
        label: "Install software",
        description: "Runs a staged installer package unattended.",
        risk: RiskLevel::High,
        auto_approve: false,
    },
];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("duplicate action id: {0}")]
    Duplicate(&'static str),
}

/// Immutable registry of permitted actions.
///
/// The only authority on which action ids exist. Build it once at startup and
/// share it by reference (`Arc<ActionCatalog>`); nothing mutates it afterward.
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    entries: BTreeMap<&'static str, ActionInfo>,
}

impl ActionCatalog {
    /// Build a catalog from a list of entries, rejecting duplicate ids.
    pub fn new(entries: impl IntoIterator<Item = ActionInfo>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for entry in entries {
            let id = entry.id;
            if map.insert(id, entry).is_some() {
                return Err(CatalogError::Duplicate(id));
            }
        }
        Ok(Self { entries: map })
    }

    /// The catalog shipped with the agent and relay.
    pub fn builtin() -> Self {
        let entries = BUILTIN
            .iter()
            .cloned()
            .map(|info| (info.id, info))
            .collect();
        Self { entries }
    }

    pub fn is_allowed(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn info(&self, id: &str) -> Option<&ActionInfo> {
        self.entries.get(id)
    }

    /// Entries ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &ActionInfo> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_contains_expected_actions() {
        let catalog = ActionCatalog::builtin();
        for id in ["flush_dns", "clear_temp_files", "restart_service", "kill_process", INSTALL_SOFTWARE] {
            assert!(catalog.is_allowed(id), "missing {id}");
        }
        assert_eq!(catalog.len(), BUILTIN.len());
    }

    #[test]
    fn unknown_action_is_not_allowed() {
        let catalog = ActionCatalog::builtin();
        assert!(!catalog.is_allowed("format_disk"));
        assert!(catalog.info("format_disk").is_none());
        assert!(!catalog.is_allowed(""));
    }

    #[test]
    fn info_reports_risk_and_approval() {
        let catalog = ActionCatalog::builtin();
        let flush = catalog.info("flush_dns").unwrap();
        assert_eq!(flush.risk, RiskLevel::Low);
        assert!(flush.auto_approve);

        let kill = catalog.info("kill_process").unwrap();
        assert_eq!(kill.risk, RiskLevel::High);
        assert!(!kill.auto_approve);
    }

    #[test]
    fn high_risk_actions_are_never_auto_approved() {
        let catalog = ActionCatalog::builtin();
        for info in catalog.iter().filter(|i| i.risk == RiskLevel::High) {
            assert!(!info.auto_approve, "{} must need approval", info.id);
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let entry = BUILTIN[0].clone();
        let err = ActionCatalog::new([entry.clone(), entry]).unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate("flush_dns")));
    }

    #[test]
    fn iteration_is_sorted_by_id() {
        let catalog = ActionCatalog::builtin();
        let ids: Vec<_> = catalog.iter().map(|i| i.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn serializes_risk_in_snake_case() {
        let catalog = ActionCatalog::builtin();
        let json = serde_json::to_value(catalog.info("restart_service").unwrap()).unwrap();
        assert_eq!(json["risk"], "medium");
        assert_eq!(json["auto_approve"], false);
    }
}
