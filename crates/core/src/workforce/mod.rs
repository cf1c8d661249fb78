// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Workforce: the singleton registry introducing managers and workers

mod registry;

pub use registry::{Workforce, WorkforceError, WorkforceNotice};
