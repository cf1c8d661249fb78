// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Expectation records: the unit of work fed in from upstream
//!
//! An expectation declares that a package should be in a given state
//! somewhere: its sources, its targets, and the content/version it must
//! carry. The record is immutable by id; a change to its definition is
//! detected at ingest and handled as a restart.

use super::container::{AccessorKind, ContainerRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for an expectation, assigned upstream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpectationId(pub String);

impl std::fmt::Display for ExpectationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExpectationId {
    fn from(s: &str) -> Self {
        ExpectationId(s.to_string())
    }
}

impl From<String> for ExpectationId {
    fn from(s: String) -> Self {
        ExpectationId(s)
    }
}

/// How the expectation is presented in operator-facing status reports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReportSettings {
    pub label: String,
    pub description: String,
    pub display_rank: i32,
    pub send_report: bool,
}

/// Options forwarded to the worker that performs the work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkOptions {
    /// Delay removal of the package by this long after the expectation
    /// disappears, in milliseconds
    pub remove_delay_ms: Option<u64>,
    /// Write to a temporary path and move into place when done
    pub use_temporary_file_path: bool,
}

/// Version fields of a media file package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFileVersion {
    pub file_size: Option<u64>,
    pub modified_ms: Option<i64>,
    pub checksum: Option<String>,
}

/// Version fields of a Quantel clip package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantelClipVersion {
    pub created: String,
    pub clone_id: Option<i64>,
}

/// The package content and version, keyed by package type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackagePayload {
    MediaFile {
        file_path: String,
        version: MediaFileVersion,
    },
    QuantelClip {
        guid: Option<String>,
        title: Option<String>,
        version: QuantelClipVersion,
    },
    JsonData {
        path: String,
    },
}

impl PackagePayload {
    /// Whether this package type can be read through the given accessor kind
    pub fn accepts_source_kind(&self, kind: AccessorKind) -> bool {
        match self {
            PackagePayload::MediaFile { .. } => matches!(
                kind,
                AccessorKind::LocalFolder
                    | AccessorKind::FileShare
                    | AccessorKind::Http
                    | AccessorKind::HttpProxy
            ),
            PackagePayload::QuantelClip { .. } => matches!(kind, AccessorKind::Quantel),
            PackagePayload::JsonData { .. } => matches!(
                kind,
                AccessorKind::LocalFolder | AccessorKind::Http | AccessorKind::CorePackageInfo
            ),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PackagePayload::MediaFile { .. } => "media_file",
            PackagePayload::QuantelClip { .. } => "quantel_clip",
            PackagePayload::JsonData { .. } => "json_data",
        }
    }
}

/// Source side of an expectation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequirement {
    pub sources: Vec<ContainerRef>,
}

/// Target side of an expectation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndRequirement {
    pub targets: Vec<ContainerRef>,
}

/// Problems found when validating an expectation definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpectationProblem {
    #[error("expectation id is empty")]
    EmptyId,
    #[error("no source containers")]
    NoSources,
    #[error("no target containers")]
    NoTargets,
    #[error("package path is empty")]
    EmptyPath,
    #[error("quantel clip has neither guid nor title")]
    MissingClipReference,
    #[error("source container {0} has no readable accessor for a {1} package")]
    SourceNotReadable(String, &'static str),
    #[error("target container {0} has no writable accessor")]
    TargetNotWritable(String),
}

/// A declarative expectation produced upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub id: ExpectationId,
    /// Total-order urgency; lower is more urgent
    pub priority: i32,
    pub status_report: StatusReportSettings,
    pub package: PackagePayload,
    /// Hash of the content version the targets must end up with
    pub content_version_hash: String,
    pub start_requirement: StartRequirement,
    pub end_requirement: EndRequirement,
    pub work_options: WorkOptions,
    /// Expectations that must be fulfilled before this one may start
    pub depends_on_fulfilled: Vec<ExpectationId>,
    /// Expectations whose fulfillment should re-evaluate this one immediately
    pub trigger_by_fulfilled_ids: Vec<ExpectationId>,
}

impl Expectation {
    /// Check the definition for config problems
    pub fn validate(&self) -> Result<(), ExpectationProblem> {
        if self.id.0.is_empty() {
            return Err(ExpectationProblem::EmptyId);
        }
        if self.start_requirement.sources.is_empty() {
            return Err(ExpectationProblem::NoSources);
        }
        if self.end_requirement.targets.is_empty() {
            return Err(ExpectationProblem::NoTargets);
        }

        match &self.package {
            PackagePayload::MediaFile { file_path, .. } if file_path.is_empty() => {
                return Err(ExpectationProblem::EmptyPath);
            }
            PackagePayload::JsonData { path } if path.is_empty() => {
                return Err(ExpectationProblem::EmptyPath);
            }
            PackagePayload::QuantelClip { guid, title, .. }
                if guid.is_none() && title.is_none() =>
            {
                return Err(ExpectationProblem::MissingClipReference);
            }
            _ => {}
        }

        for source in &self.start_requirement.sources {
            let readable = source
                .readable_kinds()
                .any(|kind| self.package.accepts_source_kind(kind));
            if !readable {
                return Err(ExpectationProblem::SourceNotReadable(
                    source.container_id.0.clone(),
                    self.package.type_name(),
                ));
            }
        }
        for target in &self.end_requirement.targets {
            if !target.has_writable_accessor() {
                return Err(ExpectationProblem::TargetNotWritable(
                    target.container_id.0.clone(),
                ));
            }
        }

        Ok(())
    }
}
