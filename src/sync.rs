// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides an atomic wrapper around an optional [`SecurityId`].

use crate::SecurityId;
use std::sync::atomic::{AtomicU32, Ordering};

/// An atomic wrapper around `Option<SecurityId>`. The raw value `0` stores `None`.
#[derive(Debug, Default)]
pub struct AtomicSecurityId(AtomicU32);

impl From<Option<SecurityId>> for AtomicSecurityId {
    fn from(sid: Option<SecurityId>) -> Self {
        Self::new(sid)
    }
}

impl From<SecurityId> for AtomicSecurityId {
    fn from(sid: SecurityId) -> Self {
        Self::new(Some(sid))
    }
}

impl AtomicSecurityId {
    /// Creates an [`AtomicSecurityId`].
    pub fn new(sid: Option<SecurityId>) -> Self {
        Self(AtomicU32::new(raw(sid)))
    }

    /// Loads the stored SID, if any.
    pub fn load(&self, order: Ordering) -> Option<SecurityId> {
        let Self(atomic_sid) = self;
        SecurityId::from_raw(atomic_sid.load(order))
    }

    /// Stores `sid`, replacing any previous value.
    pub fn store(&self, sid: Option<SecurityId>, order: Ordering) {
        let Self(atomic_sid) = self;
        atomic_sid.store(raw(sid), order)
    }

    /// Stores `sid` only if no SID is currently stored. Returns the SID that is stored once the
    /// call completes, which is `sid` if this call won.
    pub fn set_if_unset(&self, sid: SecurityId, order: Ordering) -> SecurityId {
        let Self(atomic_sid) = self;
        match atomic_sid.compare_exchange(0, sid.as_u32(), order, Ordering::Acquire) {
            Ok(_) => sid,
            Err(existing) => SecurityId::from_raw(existing).unwrap_or(sid),
        }
    }
}

fn raw(sid: Option<SecurityId>) -> u32 {
    sid.map_or(0, |sid| sid.as_u32())
}
