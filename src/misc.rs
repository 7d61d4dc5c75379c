// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Label records for kernel objects that are labeled once, at creation, and never relabeled.

use crate::common::{IpcClass, ObjectClass};
use crate::SecurityId;

macro_rules! creator_labeled {
    ($(#[$meta:meta])* $name:ident, $class:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        pub struct $name {
            sid: SecurityId,
        }

        impl $name {
            /// Returns the label of an object created by a task with `creator_sid`.
            pub fn create(creator_sid: SecurityId) -> Self {
                Self { sid: creator_sid }
            }

            pub fn sid(&self) -> SecurityId {
                self.sid
            }

            pub fn object_class(&self) -> ObjectClass {
                ObjectClass::$class
            }
        }
    };
}

creator_labeled! {
    /// The SELinux security structure for a System V message.
    MsgLabel, Msg
}

creator_labeled! {
    /// The SELinux security structure for a key in a kernel keyring.
    KeyLabel, Key
}

creator_labeled! {
    /// The SELinux security structure for an Infiniband queue pair or management datagram agent.
    IbLabel, InfinibandEndport
}

creator_labeled! {
    /// The SELinux security structure for a BPF map or program.
    BpfLabel, Bpf
}

creator_labeled! {
    /// The SELinux security structure for a perf event.
    PerfEventLabel, PerfEvent
}

/// The SELinux security structure for a System V IPC object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IpcLabel {
    sid: SecurityId,
    class: IpcClass,
}

impl IpcLabel {
    pub fn create(creator_sid: SecurityId, class: IpcClass) -> Self {
        Self { sid: creator_sid, class }
    }

    pub fn sid(&self) -> SecurityId {
        self.sid
    }

    pub fn class(&self) -> IpcClass {
        self.class
    }

    pub fn object_class(&self) -> ObjectClass {
        self.class.into()
    }
}

/// Identifies an Infiniband partition key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PkeyKey {
    pub subnet_prefix: u64,
    pub pkey: u16,
}

/// The SELinux security structure for an Infiniband partition key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PkeyLabel {
    key: PkeyKey,
    sid: SecurityId,
}

impl PkeyLabel {
    pub fn create(key: PkeyKey, sid: SecurityId) -> Self {
        Self { key, sid }
    }

    pub fn subnet_prefix(&self) -> u64 {
        self.key.subnet_prefix
    }

    pub fn pkey(&self) -> u16 {
        self.key.pkey
    }

    pub fn key(&self) -> PkeyKey {
        self.key
    }

    pub fn sid(&self) -> SecurityId {
        self.sid
    }
}
