// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::fs_node::NodeId;
use crate::task::ProcAttr;
use thiserror::Error;

/// Structured errors that may be encountered storing or resolving security labels.
///
/// None of these are fatal: a failed resolution leaves the record unresolved so the next access
/// retries, and callers that cannot obtain a label are expected to deny access.
#[derive(Debug, Error)]
pub enum LabelError {
    #[error("failed to resolve the label of node {node}")]
    ResolutionFailed {
        node: NodeId,
        #[source]
        source: anyhow::Error,
    },
    #[error("a concurrent resolution of the label of node {node} failed")]
    ConcurrentResolutionFailed { node: NodeId },
    #[error("failed to look up the label of {identity}")]
    LookupFailed {
        identity: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no label is cached for {identity}")]
    UnknownIdentity { identity: String },
    #[error("label computed under policy generation {cached}, but the active generation is {current}")]
    StaleGeneration { cached: u32, current: u32 },
    #[error("the {attr:?} attribute does not accept this value")]
    InvalidAttribute { attr: ProcAttr },
    #[error("mount {mount} has been unmounted")]
    MountNotActive { mount: String },
}

impl LabelError {
    /// Returns true if the error came from an attempt to resolve a node label, either directly or
    /// by waiting on another thread's attempt.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(self, Self::ResolutionFailed { .. } | Self::ConcurrentResolutionFailed { .. })
    }
}
