// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Package containers and the accessors used to reach them
//!
//! A container is a logical place packages live (a folder, a share, an HTTP
//! endpoint, a video-server zone). An accessor is one way of reaching it,
//! with its own credentials and read/write permissions. Expectations embed
//! full accessor descriptions so a worker can judge support without any
//! further lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a package container
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        ContainerId(s.to_string())
    }
}

/// Identifier of an accessor within a container
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessorId(pub String);

impl std::fmt::Display for AccessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccessorId {
    fn from(s: &str) -> Self {
        AccessorId(s.to_string())
    }
}

/// A way to reach a package container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Accessor {
    LocalFolder {
        folder_path: String,
        allow_read: bool,
        allow_write: bool,
    },
    FileShare {
        folder_path: String,
        user_name: Option<String>,
        password: Option<String>,
        allow_read: bool,
        allow_write: bool,
    },
    Http {
        base_url: String,
        allow_read: bool,
        allow_write: bool,
    },
    HttpProxy {
        base_url: String,
        allow_read: bool,
        allow_write: bool,
    },
    Quantel {
        gateway_url: String,
        isa_urls: Vec<String>,
        zone_id: Option<String>,
        server_id: Option<i32>,
        allow_read: bool,
        allow_write: bool,
    },
    CorePackageInfo {
        allow_read: bool,
        allow_write: bool,
    },
    AtemMediaStore {
        host: String,
        clip_index: u16,
        allow_read: bool,
        allow_write: bool,
    },
}

/// The variant of an accessor, used for capability matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessorKind {
    LocalFolder,
    FileShare,
    Http,
    HttpProxy,
    Quantel,
    CorePackageInfo,
    AtemMediaStore,
}

impl Accessor {
    pub fn kind(&self) -> AccessorKind {
        match self {
            Accessor::LocalFolder { .. } => AccessorKind::LocalFolder,
            Accessor::FileShare { .. } => AccessorKind::FileShare,
            Accessor::Http { .. } => AccessorKind::Http,
            Accessor::HttpProxy { .. } => AccessorKind::HttpProxy,
            Accessor::Quantel { .. } => AccessorKind::Quantel,
            Accessor::CorePackageInfo { .. } => AccessorKind::CorePackageInfo,
            Accessor::AtemMediaStore { .. } => AccessorKind::AtemMediaStore,
        }
    }

    pub fn allow_read(&self) -> bool {
        match self {
            Accessor::LocalFolder { allow_read, .. }
            | Accessor::FileShare { allow_read, .. }
            | Accessor::Http { allow_read, .. }
            | Accessor::HttpProxy { allow_read, .. }
            | Accessor::Quantel { allow_read, .. }
            | Accessor::CorePackageInfo { allow_read, .. }
            | Accessor::AtemMediaStore { allow_read, .. } => *allow_read,
        }
    }

    pub fn allow_write(&self) -> bool {
        match self {
            Accessor::LocalFolder { allow_write, .. }
            | Accessor::FileShare { allow_write, .. }
            | Accessor::Http { allow_write, .. }
            | Accessor::HttpProxy { allow_write, .. }
            | Accessor::Quantel { allow_write, .. }
            | Accessor::CorePackageInfo { allow_write, .. }
            | Accessor::AtemMediaStore { allow_write, .. } => *allow_write,
        }
    }
}

/// A container as referenced from inside an expectation
///
/// Carries the full accessor map so the requirement pair is self-contained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_id: ContainerId,
    pub label: String,
    pub accessors: HashMap<AccessorId, Accessor>,
}

impl ContainerRef {
    /// Accessor kinds that permit reading from this container
    pub fn readable_kinds(&self) -> impl Iterator<Item = AccessorKind> + '_ {
        self.accessors
            .values()
            .filter(|a| a.allow_read())
            .map(|a| a.kind())
    }

    pub fn has_writable_accessor(&self) -> bool {
        self.accessors.values().any(|a| a.allow_write())
    }
}

/// A package container as configured for monitoring and cleanup duties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageContainer {
    pub id: ContainerId,
    pub label: String,
    pub accessors: HashMap<AccessorId, Accessor>,
}
