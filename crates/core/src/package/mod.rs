// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative package model: expectations, containers, accessors

mod container;
mod expectation;

pub use container::{Accessor, AccessorId, AccessorKind, ContainerId, ContainerRef, PackageContainer};
pub use expectation::{
    EndRequirement, Expectation, ExpectationId, ExpectationProblem, MediaFileVersion,
    PackagePayload, QuantelClipVersion, StartRequirement, StatusReportSettings, WorkOptions,
};
