//! Catalog-gated remediation actions.
//!
//! Each action is a [`RemediationAction`] registered under a catalog id. The
//! dispatcher refuses anything the catalog does not know, checks parameter
//! and elevation requirements before running, and turns every error or
//! panic into a [`RemediationResult`].

pub mod actions;
pub mod elevation;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::catalog::{ActionCatalog, RiskLevel};
use crate::runner::ProcessRunner;
pub use elevation::Elevation;

/// What a successful action reports back.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    pub message: String,
    pub output: String,
}

impl ActionOutput {
    pub fn new(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: output.into(),
        }
    }
}

/// A remediation the agent knows how to perform.
///
/// `requires_elevation` and `parameter` have no defaults: every action states
/// both explicitly.
pub trait RemediationAction: Send + Sync {
    /// Catalog id this handler serves.
    fn id(&self) -> &'static str;

    fn requires_elevation(&self) -> bool;

    /// Name of the required parameter, if the action takes one.
    fn parameter(&self) -> Option<&'static str>;

    /// Perform the action. `parameter` is trimmed and non-empty whenever
    /// [`parameter`](Self::parameter) is `Some`.
    fn run<'a>(&'a self, parameter: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationResult {
    pub action_id: String,
    pub success: bool,
    pub message: String,
    pub output: String,
}

impl RemediationResult {
    pub fn failure(action_id: &str, message: impl Into<String>) -> Self {
        Self {
            action_id: action_id.to_string(),
            success: false,
            message: message.into(),
            output: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("action {0} is not in the catalog")]
    NotInCatalog(&'static str),
    #[error("action {0} already has a handler")]
    Duplicate(&'static str),
    #[error("high-risk action {0} must require elevation")]
    HighRiskWithoutElevation(&'static str),
}

/// Maps catalog ids to handlers and runs them.
pub struct RemediationDispatcher {
    catalog: Arc<ActionCatalog>,
    elevation: Elevation,
    handlers: HashMap<&'static str, Box<dyn RemediationAction>>,
}

impl RemediationDispatcher {
    pub fn new(catalog: Arc<ActionCatalog>, elevation: Elevation) -> Self {
        Self {
            catalog,
            elevation,
            handlers: HashMap::new(),
        }
    }

    /// Dispatcher with every built-in action registered.
    pub fn with_builtin_actions(
        catalog: Arc<ActionCatalog>,
        elevation: Elevation,
        runner: ProcessRunner,
    ) -> Result<Self, RegistrationError> {
        let mut dispatcher = Self::new(catalog, elevation);
        dispatcher.register(actions::FlushDns::new(runner.clone()))?;
        dispatcher.register(actions::ClearTempFiles::new(std::env::temp_dir()))?;
        dispatcher.register(actions::RestartService::new(runner))?;
        dispatcher.register(actions::KillProcess)?;
        Ok(dispatcher)
    }

    pub fn register(&mut self, action: impl RemediationAction + 'static) -> Result<(), RegistrationError> {
        let id = action.id();
        let info = self
            .catalog
            .info(id)
            .ok_or(RegistrationError::NotInCatalog(id))?;
        if info.risk == RiskLevel::High && !action.requires_elevation() {
            return Err(RegistrationError::HighRiskWithoutElevation(id));
        }
        if self.handlers.contains_key(id) {
            return Err(RegistrationError::Duplicate(id));
        }
        self.handlers.insert(id, Box::new(action));
        Ok(())
    }

    pub fn elevation(&self) -> Elevation {
        self.elevation
    }

    pub async fn execute(&self, action_id: &str, parameter: Option<&str>) -> RemediationResult {
        let handler = match self.handlers.get(action_id) {
            Some(h) if self.catalog.is_allowed(action_id) => h,
            _ => {
                tracing::warn!(action = action_id, "refusing unknown remediation action");
                return RemediationResult::failure(action_id, format!("unknown action: {action_id}"));
            }
        };

        let parameter = parameter.map(str::trim).filter(|p| !p.is_empty());
        if let Some(name) = handler.parameter() {
            if parameter.is_none() {
                return RemediationResult::failure(
                    action_id,
                    format!("action {action_id} requires parameter `{name}`"),
                );
            }
        }

        if handler.requires_elevation() && !self.elevation.is_elevated() {
            tracing::warn!(action = action_id, "remediation action needs elevation");
            return RemediationResult::failure(
                action_id,
                format!(
                    "action {action_id} requires administrator privileges; re-run the agent elevated"
                ),
            );
        }

        tracing::info!(action = action_id, ?parameter, "running remediation action");
        match AssertUnwindSafe(handler.run(parameter)).catch_unwind().await {
            Ok(Ok(out)) => RemediationResult {
                action_id: action_id.to_string(),
                success: true,
                message: out.message,
                output: out.output,
            },
            Ok(Err(e)) => {
                tracing::warn!(action = action_id, error = %e, "remediation action failed");
                RemediationResult::failure(action_id, format!("{e:#}"))
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(action = action_id, "remediation action panicked: {msg}");
                RemediationResult::failure(action_id, format!("action panicked: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        id: &'static str,
        elevated: bool,
        parameter: Option<&'static str>,
        calls: Arc<AtomicUsize>,
        behaviour: fn(Option<&str>) -> anyhow::Result<ActionOutput>,
    }

    impl Recorder {
        fn new(id: &'static str) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let recorder = Self {
                id,
                elevated: false,
                parameter: None,
                calls: calls.clone(),
                behaviour: |_| Ok(ActionOutput::new("done", "")),
            };
            (recorder, calls)
        }
    }

    impl RemediationAction for Recorder {
        fn id(&self) -> &'static str {
            self.id
        }
        fn requires_elevation(&self) -> bool {
            self.elevated
        }
        fn parameter(&self) -> Option<&'static str> {
            self.parameter
        }
        fn run<'a>(&'a self, parameter: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = (self.behaviour)(parameter);
            async move { result }.boxed()
        }
    }

    fn dispatcher(elevation: Elevation) -> RemediationDispatcher {
        RemediationDispatcher::new(Arc::new(ActionCatalog::builtin()), elevation)
    }

    #[tokio::test]
    async fn runs_registered_action() {
        let mut d = dispatcher(Elevation::NotElevated);
        let (recorder, calls) = Recorder::new("flush_dns");
        d.register(recorder).unwrap();
        let result = d.execute("flush_dns", None).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.message, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_action_runs_nothing() {
        let d = dispatcher(Elevation::Elevated);
        let result = d.execute("format_disk", None).await;
        assert!(!result.success);
        assert!(result.message.contains("unknown action"));

        // In the catalog but without a handler.
        let result = d.execute("install_software", None).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn missing_parameter_is_named() {
        let mut d = dispatcher(Elevation::Elevated);
        let (mut recorder, calls) = Recorder::new("restart_service");
        recorder.parameter = Some("service");
        d.register(recorder).unwrap();
        for param in [None, Some(""), Some("   ")] {
            let result = d.execute("restart_service", param).await;
            assert!(!result.success);
            assert!(result.message.contains("`service`"), "{}", result.message);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn elevation_required_but_absent() {
        let mut d = dispatcher(Elevation::NotElevated);
        let (mut recorder, calls) = Recorder::new("kill_process");
        recorder.elevated = true;
        d.register(recorder).unwrap();
        let result = d.execute("kill_process", Some("1234")).await;
        assert!(!result.success);
        assert!(result.message.contains("elevated"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn high_risk_handler_must_require_elevation() {
        let mut d = dispatcher(Elevation::Elevated);
        let (recorder, _) = Recorder::new("kill_process");
        assert!(matches!(
            d.register(recorder),
            Err(RegistrationError::HighRiskWithoutElevation("kill_process"))
        ));
    }

    #[test]
    fn registration_checks_catalog_and_duplicates() {
        let mut d = dispatcher(Elevation::Elevated);
        let (recorder, _) = Recorder::new("reformat");
        assert!(matches!(d.register(recorder), Err(RegistrationError::NotInCatalog(_))));
        let (a, _) = Recorder::new("flush_dns");
        let (b, _) = Recorder::new("flush_dns");
        d.register(a).unwrap();
        assert!(matches!(d.register(b), Err(RegistrationError::Duplicate(_))));
    }

    #[tokio::test]
    async fn handler_error_becomes_failure() {
        let mut d = dispatcher(Elevation::NotElevated);
        let (mut recorder, _) = Recorder::new("clear_temp_files");
        recorder.behaviour = |_| Err(anyhow::anyhow!("disk on fire"));
        d.register(recorder).unwrap();
        let result = d.execute("clear_temp_files", None).await;
        assert!(!result.success);
        assert_eq!(result.message, "disk on fire");
    }

    #[tokio::test]
    async fn handler_panic_becomes_failure() {
        struct Panics;
        impl RemediationAction for Panics {
            fn id(&self) -> &'static str {
                "flush_dns"
            }
            fn requires_elevation(&self) -> bool {
                false
            }
            fn parameter(&self) -> Option<&'static str> {
                None
            }
            fn run<'a>(&'a self, _: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>> {
                Box::pin(async {
                    if self.id() == "flush_dns" {
                        panic!("boom");
                    }
                    Ok(ActionOutput::default())
                })
            }
        }
        let mut d = dispatcher(Elevation::NotElevated);
        d.register(Panics).unwrap();
        let result = d.execute("flush_dns", None).await;
        assert!(!result.success);
        assert!(result.message.contains("boom"));
    }

    #[test]
    fn builtin_actions_register_cleanly() {
        let d = RemediationDispatcher::with_builtin_actions(
            Arc::new(ActionCatalog::builtin()),
            Elevation::NotElevated,
            ProcessRunner::new(),
        )
        .unwrap();
        assert_eq!(d.handlers.len(), 4);
    }
}
