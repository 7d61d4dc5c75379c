// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::error::LabelError;
use crate::sync::AtomicSecurityId;
use crate::SecurityId;

use std::sync::atomic::{AtomicU32, Ordering};

/// The SELinux security structure for an open file description.
#[derive(Debug)]
pub struct FileLabel {
    /// SID of the task that opened the file.
    sid: SecurityId,
    /// SID of the file owner, used to check delivery of SIGIO and SIGURG.
    fown_sid: AtomicSecurityId,
    /// SID of the node, as observed when the file was opened or last revalidated.
    isid: AtomicSecurityId,
    /// Policy generation under which `isid` was observed.
    pseqno: AtomicU32,
}

impl FileLabel {
    /// Returns the label of a file opened by a task with `sid`, for a node labeled `node_sid`
    /// under policy `generation`. The file owner is initially the opener.
    pub fn new(sid: SecurityId, node_sid: SecurityId, generation: u32) -> Self {
        Self {
            sid,
            fown_sid: sid.into(),
            isid: node_sid.into(),
            pseqno: AtomicU32::new(generation),
        }
    }

    pub fn sid(&self) -> SecurityId {
        self.sid
    }

    pub fn fown_sid(&self) -> SecurityId {
        self.fown_sid.load(Ordering::Acquire).unwrap_or(self.sid)
    }

    /// Records `sid` as the owner of the file, e.g. on `F_SETOWN`.
    pub fn set_fown_sid(&self, sid: SecurityId) {
        self.fown_sid.store(Some(sid), Ordering::Release);
    }

    pub fn isid(&self) -> SecurityId {
        self.isid.load(Ordering::Acquire).unwrap_or(self.sid)
    }

    pub fn generation(&self) -> u32 {
        self.pseqno.load(Ordering::Acquire)
    }

    /// Returns the node SID observed at open, provided it was observed under `generation`.
    pub fn revalidate(&self, generation: u32) -> Result<SecurityId, LabelError> {
        let cached = self.generation();
        if cached != generation {
            return Err(LabelError::StaleGeneration { cached, current: generation });
        }
        Ok(self.isid())
    }

    /// Records the node SID as observed under `generation`, after a permission re-check.
    pub fn refresh(&self, node_sid: SecurityId, generation: u32) {
        self.isid.store(Some(node_sid), Ordering::Release);
        self.pseqno.store(generation, Ordering::Release);
    }
}
