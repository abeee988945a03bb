//! Tether reconcile: ownership index, reconciler, pruner and status rollup.

#![forbid(unsafe_code)]

pub mod config;
pub mod owned;
pub mod reconciler;
pub mod status;

pub use config::{ReconcileConfig, StatusConfig};
pub use owned::find_owned;
pub use reconciler::{set_controller_ref, ObjectOutcome, Outcome, OwnerRefError, ReconcileError, ReconcileReport, Reconciler};
pub use status::{aggregate, parse_version, Aggregate, StatusError, StatusIssue, Summary, VersionError};
