// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::error::LabelError;
use crate::sync::AtomicSecurityId;
use crate::{InitialSid, SecurityId};

use std::sync::atomic::{AtomicU64, Ordering};

bitflags::bitflags! {
    /// Sticky restrictions applied to a task. Once set, a flag stays set for the remaining life of
    /// the task, including across `exec()`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DenyFlags: u64 {
        const DENY_EXECMEM = 1 << 0;
        const DENY_EXECMOD = 1 << 1;
        const DENY_EXECUTE_APPDOMAIN_TMPFS = 1 << 2;
        const DENY_EXECUTE_APP_DATA_FILE = 1 << 3;
        const DENY_EXECUTE_NO_TRANS_APP_DATA_FILE = 1 << 4;
        const DENY_EXECUTE_ASHMEM_DEVICE = 1 << 5;
        const DENY_EXECUTE_ASHMEM_LIBCUTILS_DEVICE = 1 << 6;
        const DENY_EXECUTE_PRIVAPP_DATA_FILE = 1 << 7;
        const DENY_PROCESS_PTRACE = 1 << 8;

        /// All of the deny-execute-from-location restrictions.
        const ALL_DENY_EXECUTE = Self::DENY_EXECUTE_APPDOMAIN_TMPFS.bits()
            | Self::DENY_EXECUTE_APP_DATA_FILE.bits()
            | Self::DENY_EXECUTE_NO_TRANS_APP_DATA_FILE.bits()
            | Self::DENY_EXECUTE_ASHMEM_DEVICE.bits()
            | Self::DENY_EXECUTE_ASHMEM_LIBCUTILS_DEVICE.bits()
            | Self::DENY_EXECUTE_PRIVAPP_DATA_FILE.bits();
    }
}

/// The `/proc/<pid>/attr/` entries through which a task's labels are exposed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcAttr {
    Current,
    Exec,
    FsCreate,
    KeyCreate,
    Previous,
    SockCreate,
}

/// A point-in-time copy of a task's security attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskAttrs {
    /// Current SID for the task.
    pub current_sid: SecurityId,

    /// SID prior to the last execve.
    pub previous_sid: SecurityId,

    /// SID for the task upon the next execve call.
    pub exec_sid: Option<SecurityId>,

    /// SID for files created by the task.
    pub fscreate_sid: Option<SecurityId>,

    /// SID for kernel-managed keys created by the task.
    pub keycreate_sid: Option<SecurityId>,

    /// SID for sockets created by the task.
    pub sockcreate_sid: Option<SecurityId>,

    /// Sticky restrictions set on the task.
    pub deny_flags: DenyFlags,
}

/// The SELinux security structure for a task.
///
/// Fields are individually atomic. Only the owning task, or the exec transition it performs,
/// writes them; other tasks may read them at any time and must treat what they read as a
/// snapshot that can change concurrently.
#[derive(Debug)]
pub struct TaskState {
    current_sid: AtomicSecurityId,
    previous_sid: AtomicSecurityId,
    exec_sid: AtomicSecurityId,
    fscreate_sid: AtomicSecurityId,
    keycreate_sid: AtomicSecurityId,
    sockcreate_sid: AtomicSecurityId,
    deny_flags: AtomicU64,
}

impl TaskState {
    fn new(attrs: TaskAttrs) -> Self {
        Self {
            current_sid: attrs.current_sid.into(),
            previous_sid: attrs.previous_sid.into(),
            exec_sid: attrs.exec_sid.into(),
            fscreate_sid: attrs.fscreate_sid.into(),
            keycreate_sid: attrs.keycreate_sid.into(),
            sockcreate_sid: attrs.sockcreate_sid.into(),
            deny_flags: AtomicU64::new(attrs.deny_flags.bits()),
        }
    }

    /// Returns initial state for the kernel's root task.
    pub fn for_kernel() -> Self {
        Self::with_sid(SecurityId::initial(InitialSid::Kernel))
    }

    /// Returns placeholder state for use when SELinux is not enabled.
    pub fn for_selinux_disabled() -> Self {
        Self::with_sid(SecurityId::initial(InitialSid::Unlabeled))
    }

    /// Returns state for a task running with `sid` and no per-purpose labels.
    pub fn with_sid(sid: SecurityId) -> Self {
        Self::new(TaskAttrs {
            current_sid: sid,
            previous_sid: sid,
            exec_sid: None,
            fscreate_sid: None,
            keycreate_sid: None,
            sockcreate_sid: None,
            deny_flags: DenyFlags::empty(),
        })
    }

    /// Returns a `TaskState` for a new task. A child inherits every label and restriction of its
    /// `parent`.
    pub fn alloc(parent: Option<&TaskState>) -> Self {
        match parent {
            Some(parent) => Self::new(parent.snapshot()),
            None => Self::for_kernel(),
        }
    }

    /// Returns a copy of all of the task's attributes.
    pub fn snapshot(&self) -> TaskAttrs {
        TaskAttrs {
            current_sid: self.current_sid(),
            previous_sid: self.previous_sid(),
            exec_sid: self.exec_sid.load(Ordering::Acquire),
            fscreate_sid: self.fscreate_sid.load(Ordering::Acquire),
            keycreate_sid: self.keycreate_sid.load(Ordering::Acquire),
            sockcreate_sid: self.sockcreate_sid.load(Ordering::Acquire),
            deny_flags: self.deny_flags(),
        }
    }

    pub fn current_sid(&self) -> SecurityId {
        required(&self.current_sid)
    }

    pub fn previous_sid(&self) -> SecurityId {
        required(&self.previous_sid)
    }

    pub fn exec_sid(&self) -> Option<SecurityId> {
        self.exec_sid.load(Ordering::Acquire)
    }

    pub fn fscreate_sid(&self) -> Option<SecurityId> {
        self.fscreate_sid.load(Ordering::Acquire)
    }

    pub fn keycreate_sid(&self) -> Option<SecurityId> {
        self.keycreate_sid.load(Ordering::Acquire)
    }

    pub fn sockcreate_sid(&self) -> Option<SecurityId> {
        self.sockcreate_sid.load(Ordering::Acquire)
    }

    pub fn deny_flags(&self) -> DenyFlags {
        DenyFlags::from_bits_retain(self.deny_flags.load(Ordering::Acquire))
    }

    pub fn has_deny_flag(&self, flag: DenyFlags) -> bool {
        self.deny_flags().contains(flag)
    }

    /// Sets `flag` on the task. There is deliberately no way to clear a flag.
    pub fn set_deny_flag(&self, flag: DenyFlags) {
        self.deny_flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Moves the task into `new_sid` as part of `exec()`. The old current SID becomes the previous
    /// SID, and the per-purpose SIDs chosen for the old program image are cleared. Deny flags are
    /// unaffected.
    pub fn on_exec_transition(&self, new_sid: SecurityId) {
        let old_sid = self.current_sid();
        self.previous_sid.store(Some(old_sid), Ordering::Release);
        self.current_sid.store(Some(new_sid), Ordering::Release);
        self.exec_sid.store(None, Ordering::Release);
        self.fscreate_sid.store(None, Ordering::Release);
        self.keycreate_sid.store(None, Ordering::Release);
        self.sockcreate_sid.store(None, Ordering::Release);
    }

    /// Returns the SID exposed through the `attr` entry, if one is set.
    pub fn get_attr(&self, attr: ProcAttr) -> Option<SecurityId> {
        match attr {
            ProcAttr::Current => Some(self.current_sid()),
            ProcAttr::Exec => self.exec_sid(),
            ProcAttr::FsCreate => self.fscreate_sid(),
            ProcAttr::KeyCreate => self.keycreate_sid(),
            ProcAttr::Previous => Some(self.previous_sid()),
            ProcAttr::SockCreate => self.sockcreate_sid(),
        }
    }

    /// Sets, or clears when `sid` is `None`, the SID exposed through the `attr` entry.
    /// The previous SID is read-only, and the current SID cannot be cleared.
    pub fn set_attr(&self, attr: ProcAttr, sid: Option<SecurityId>) -> Result<(), LabelError> {
        let slot = match attr {
            ProcAttr::Current => {
                let sid = sid.ok_or(LabelError::InvalidAttribute { attr })?;
                self.current_sid.store(Some(sid), Ordering::Release);
                return Ok(());
            }
            ProcAttr::Exec => &self.exec_sid,
            ProcAttr::FsCreate => &self.fscreate_sid,
            ProcAttr::KeyCreate => &self.keycreate_sid,
            ProcAttr::Previous => return Err(LabelError::InvalidAttribute { attr }),
            ProcAttr::SockCreate => &self.sockcreate_sid,
        };
        slot.store(sid, Ordering::Release);
        Ok(())
    }
}

fn required(slot: &AtomicSecurityId) -> SecurityId {
    // Constructors always populate the required slots.
    slot.load(Ordering::Acquire).unwrap_or_else(|| SecurityId::initial(InitialSid::Unlabeled))
}
