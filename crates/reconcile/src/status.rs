//! Status rollup across owned workloads.
//!
//! Every count is the minimum over the considered workloads, so one lagging component
//! degrades the whole summary. With no workloads every count is 0. A 0 is therefore
//! also what an unobserved workload reports.

use std::fmt;

use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::Value as Json;
use tether_core::StoreError;

use crate::config::StatusConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub replicas: i32,
    pub available_replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
    pub unavailable_replicas: i32,
    pub initialized: bool,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{object}: invalid version label {value:?}: {reason}")]
pub struct VersionError {
    pub object: String,
    pub value: String,
    pub reason: String,
}

/// A summary plus the version labels that could not be parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub summary: Summary,
    pub version_errors: Vec<VersionError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    desired: i32,
    replicas: i32,
    available: i32,
    ready: i32,
    updated: i32,
    unavailable: i32,
}

fn int_at(v: &Json, pointer: &str) -> Option<i32> {
    v.pointer(pointer).and_then(Json::as_i64).map(|n| n.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
}

fn counts(obj: &DynamicObject) -> Counts {
    let status = |f: &str| int_at(&obj.data, &format!("/status/{f}")).unwrap_or(0);
    Counts {
        desired: int_at(&obj.data, "/spec/replicas").unwrap_or(1),
        replicas: status("replicas"),
        available: status("availableReplicas"),
        ready: status("readyReplicas"),
        updated: status("updatedReplicas"),
        unavailable: status("unavailableReplicas"),
    }
}

fn label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str).filter(|v| !v.is_empty())
}

/// Parse a version label, tolerating a leading `v` and a missing minor or patch
/// number (`v1.30` reads as 1.30.0).
pub fn parse_version(raw: &str) -> Result<semver::Version, semver::Error> {
    let trimmed = raw.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let (core, rest) = bare.split_at(bare.find(|c: char| c == '-' || c == '+').unwrap_or(bare.len()));
    let padding = match core.matches('.').count() {
        0 => ".0.0",
        1 => ".0",
        _ => "",
    };
    semver::Version::parse(&format!("{core}{padding}{rest}"))
}

/// Roll up workload objects. Callers pass workloads only.
pub fn aggregate<'a, I>(config: &StatusConfig, workloads: I) -> Aggregate
where
    I: IntoIterator<Item = &'a DynamicObject>,
{
    let mut min: Option<Counts> = None;
    let mut all_ready = true;
    let mut initialized = false;
    let mut lowest: Option<(semver::Version, String)> = None;
    let mut version_errors = Vec::new();

    for obj in workloads {
        let c = counts(obj);
        if c.ready < c.desired {
            all_ready = false;
        }
        min = Some(match min {
            None => c,
            Some(m) => Counts {
                desired: m.desired.min(c.desired),
                replicas: m.replicas.min(c.replicas),
                available: m.available.min(c.available),
                ready: m.ready.min(c.ready),
                updated: m.updated.min(c.updated),
                unavailable: m.unavailable.min(c.unavailable),
            },
        });

        let component = label(obj, &config.component_label);
        if component == Some(config.init_component.as_str()) && c.ready > 0 {
            initialized = true;
        }
        if component.is_some_and(|comp| config.unversioned.iter().any(|u| u == comp)) {
            continue;
        }
        let Some(raw) = label(obj, &config.version_label) else { continue };
        match parse_version(raw) {
            Ok(v) => {
                if lowest.as_ref().map_or(true, |(low, _)| v < *low) {
                    lowest = Some((v, raw.to_string()));
                }
            }
            Err(e) => version_errors.push(VersionError {
                object: obj.metadata.name.clone().unwrap_or_default(),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    let m = min.unwrap_or_default();
    Aggregate {
        summary: Summary {
            version: lowest.map(|(_, raw)| raw),
            replicas: m.replicas,
            available_replicas: m.available,
            ready_replicas: m.ready,
            updated_replicas: m.updated,
            unavailable_replicas: m.unavailable,
            initialized,
            ready: all_ready,
        },
        version_errors,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusIssue {
    #[error("finding owned workloads: {0}")]
    Index(StoreError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("not all components are ready")]
    NotReady,
    #[error("failed to apply status changes: {0}")]
    Write(StoreError),
}

/// Everything that went wrong during one status pass. `summary` is set when one was computed,
/// whether or not it was written.
#[derive(Debug)]
pub struct StatusError {
    pub summary: Option<Summary>,
    pub issues: Vec<StatusIssue>,
}

impl StatusError {
    pub fn iter(&self) -> std::slice::Iter<'_, StatusIssue> { self.issues.iter() }

    pub fn not_ready(&self) -> bool { self.issues.iter().any(|i| matches!(i, StatusIssue::NotReady)) }

    /// Only the readiness condition, which clears on its own as workloads come up.
    pub fn only_not_ready(&self) -> bool {
        self.issues.iter().all(|i| matches!(i, StatusIssue::NotReady))
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.issues.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for StatusError {}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ApiResource;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn workload(name: &str, component: &str, version: Option<&str>, desired: Option<i32>, ready: i32) -> DynamicObject {
        let ar = ApiResource::erase::<k8s_openapi::api::apps::v1::Deployment>(&());
        let mut spec = json!({});
        if let Some(d) = desired {
            spec["replicas"] = json!(d);
        }
        let mut obj = DynamicObject::new(name, &ar).within("ns").data(json!({
            "spec": spec,
            "status": {"replicas": ready + 1, "readyReplicas": ready, "availableReplicas": ready, "updatedReplicas": ready, "unavailableReplicas": 1}
        }));
        let mut labels = BTreeMap::from([("app.kubernetes.io/component".to_string(), component.to_string())]);
        if let Some(v) = version {
            labels.insert("app.kubernetes.io/version".into(), v.into());
        }
        obj.metadata.labels = Some(labels);
        obj
    }

    #[test]
    fn lowest_version_wins_and_kine_is_ignored() {
        let objs = [
            workload("api", "api-server", Some("v1.3.0"), Some(1), 1),
            workload("cm", "controller-manager", Some("v1.2.0"), Some(1), 1),
            workload("kine", "kine", Some("v9.9.9"), Some(1), 1),
        ];
        let agg = aggregate(&StatusConfig::default(), &objs);
        assert_eq!(agg.summary.version.as_deref(), Some("v1.2.0"));
        assert!(agg.summary.initialized);
        assert!(agg.summary.ready);
        assert!(agg.version_errors.is_empty());
    }

    #[test]
    fn bad_versions_are_collected_not_fatal() {
        let objs = [
            workload("api", "api-server", Some("latest"), None, 0),
            workload("sched", "scheduler", Some("1.30.2"), None, 1),
        ];
        let agg = aggregate(&StatusConfig::default(), &objs);
        assert_eq!(agg.summary.version.as_deref(), Some("1.30.2"));
        assert_eq!(agg.version_errors.len(), 1);
        assert_eq!(agg.version_errors[0].value, "latest");
        assert!(!agg.summary.initialized);
        assert!(!agg.summary.ready, "unset replicas means one is wanted");
    }

    #[test]
    fn short_versions_take_part_in_the_rollup() {
        let objs = [
            workload("api", "api-server", Some("v1.31.0"), Some(1), 1),
            workload("sched", "scheduler", Some("v1.30"), Some(1), 1),
        ];
        let agg = aggregate(&StatusConfig::default(), &objs);
        assert!(agg.version_errors.is_empty(), "{:?}", agg.version_errors);
        assert_eq!(agg.summary.version.as_deref(), Some("v1.30"));
    }

    #[test]
    fn versions_pad_missing_parts_and_keep_prerelease() {
        assert_eq!(parse_version("v1.30").unwrap(), semver::Version::new(1, 30, 0));
        assert_eq!(parse_version("2").unwrap(), semver::Version::new(2, 0, 0));
        assert_eq!(parse_version(" v1.29.4 ").unwrap(), semver::Version::new(1, 29, 4));
        let pre = parse_version("v1.30-rc.1").unwrap();
        assert_eq!((pre.major, pre.minor, pre.patch), (1, 30, 0));
        assert_eq!(pre.pre.as_str(), "rc.1");
        assert!(parse_version("latest").is_err());
        assert!(parse_version("v").is_err());
    }

    #[test]
    fn no_workloads_rolls_up_to_zero() {
        let agg = aggregate(&StatusConfig::default(), std::iter::empty());
        assert_eq!(agg.summary, Summary { ready: true, ..Summary::default() });
    }

    #[test]
    fn summary_serializes_as_status_fields() {
        let s = Summary { version: None, ready_replicas: 2, ready: true, ..Summary::default() };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["readyReplicas"], json!(2));
        assert!(v.get("version").is_none());
    }

    #[test]
    fn status_error_joins_every_issue() {
        let err = StatusError { summary: None, issues: vec![StatusIssue::NotReady, StatusIssue::Write(StoreError::Conflict("Stack ns/s".into()))] };
        assert!(err.not_ready());
        assert!(!err.only_not_ready());
        assert_eq!(
            err.to_string(),
            "not all components are ready; failed to apply status changes: conflict writing Stack ns/s: the object has been modified"
        );
    }

    proptest! {
        #[test]
        fn ready_is_the_minimum_and_all_ready_is_pointwise(counts in prop::collection::vec((0i32..5, 0i32..5), 1..6)) {
            let objs: Vec<_> = counts
                .iter()
                .enumerate()
                .map(|(i, (d, r))| workload(&format!("w{i}"), "c", None, Some(*d), *r))
                .collect();
            let agg = aggregate(&StatusConfig::default(), &objs);
            let min_ready = counts.iter().map(|(_, r)| *r).min().unwrap_or(0);
            prop_assert_eq!(agg.summary.ready_replicas, min_ready);
            prop_assert_eq!(agg.summary.ready, counts.iter().all(|(d, r)| r >= d));
        }
    }
}
