//! Explicitly loaded engine configuration.

use tether_apply::RetryPolicy;

/// Labels and component names the status rollup keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusConfig {
    pub component_label: String,
    pub version_label: String,
    /// Component whose readiness marks the owner initialized.
    pub init_component: String,
    /// Components left out of the version rollup.
    pub unversioned: Vec<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            component_label: "app.kubernetes.io/component".into(),
            version_label: "app.kubernetes.io/version".into(),
            init_component: "api-server".into(),
            unversioned: vec!["kine".into()],
        }
    }
}

impl StatusConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let var = |name: &str| std::env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            component_label: var("TETHER_COMPONENT_LABEL").unwrap_or(d.component_label),
            version_label: var("TETHER_VERSION_LABEL").unwrap_or(d.version_label),
            init_component: var("TETHER_INIT_COMPONENT").unwrap_or(d.init_component),
            unversioned: std::env::var("TETHER_UNVERSIONED_COMPONENTS").map(|s| parse_list(&s)).unwrap_or(d.unversioned),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileConfig {
    pub retry: RetryPolicy,
    pub status: StatusConfig,
}

impl ReconcileConfig {
    /// Load `TETHER_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        Self { retry: RetryPolicy::from_env(), status: StatusConfig::from_env() }
    }
}

pub(crate) fn parse_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}
