// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-object SELinux security state for kernel objects.
//!
//! Every kernel-managed resource (tasks, filesystem nodes, mounts, open files, sockets, network
//! interfaces, nodes and ports, IPC objects, keys, ...) carries a [`SecurityId`] naming its
//! security label. This crate owns those labels: it stores them, lazily resolves the labels of
//! filesystem nodes, and keeps label records valid for concurrent readers while the objects they
//! decorate are created and destroyed. Policy evaluation is left to the caller.

pub mod common;
pub mod error;
pub mod file;
pub mod fs_node;
pub mod hooks;
pub mod misc;
pub mod mount;
pub mod net;
pub mod sync;
pub mod task;

pub use common::{InitialSid, ObjectClass, FIRST_UNUSED_SID};
pub use error::LabelError;
pub use hooks::{Mode, SecurityConfig, SecurityState};

use std::num::NonZeroU32;

/// The Security ID (SID) used internally to refer to a security context.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SecurityId(NonZeroU32);

impl SecurityId {
    /// Returns a `SecurityId` encoding the specified initial Security Context.
    /// These are used when labeling kernel resources created before policy
    /// load, allowing the policy to determine the Security Context to use.
    pub fn initial(initial_sid: InitialSid) -> Self {
        Self(initial_sid.as_non_zero())
    }

    /// Wraps a raw SID value handed out by the label table. Returns `None` for `0`, which
    /// denotes an unset label.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw integer form of this SID.
    pub fn as_u32(&self) -> u32 {
        self.0.get()
    }
}

impl From<InitialSid> for SecurityId {
    fn from(initial_sid: InitialSid) -> Self {
        Self::initial(initial_sid)
    }
}
