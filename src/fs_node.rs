// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::common::FileClass;
use crate::error::LabelError;
use crate::mount::{LabelingBehavior, MountFlags, MountLabel};
use crate::{InitialSid, SecurityId};

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Identifies a filesystem node within its mount.
pub type NodeId = u64;

/// Describes a node whose label must be computed by a [`LabelResolver`].
#[derive(Clone, Debug)]
pub struct FsNodeLabelRequest<'a> {
    /// The node being labeled.
    pub node_id: NodeId,
    /// Name of the mount on which the node lives.
    pub mount_name: &'a str,
    /// SID of the task that created the node (or first brought it into memory).
    pub task_sid: SecurityId,
    /// Class of the node.
    pub class: FileClass,
    /// How nodes on the mount are labeled.
    pub behavior: LabelingBehavior,
    /// SID of the mount itself.
    pub mount_sid: SecurityId,
    /// SID to apply if the node carries no label of its own.
    pub default_sid: SecurityId,
}

/// Source of labels that cannot be derived from the label store alone: stored extended
/// attributes, per-path policy rules, transition rules and the policy's network labeling
/// statements. Implemented outside this crate.
pub trait LabelResolver: Send + Sync {
    /// Computes the label of the node described by `request`. Returns `Ok(None)` if the node has
    /// no label of its own, in which case the mount's default SID is applied.
    fn resolve_fs_node(
        &self,
        request: &FsNodeLabelRequest<'_>,
    ) -> Result<Option<SecurityId>, anyhow::Error>;

    /// Returns the SID of the network interface `ifindex` in `namespace`.
    fn netif_sid(&self, namespace: u64, ifindex: i32) -> Result<SecurityId, anyhow::Error>;

    /// Returns the SID of the network node (host address) `address`.
    fn node_sid(&self, address: std::net::IpAddr) -> Result<SecurityId, anyhow::Error>;

    /// Returns the SID of `port` for the transport `protocol`.
    fn port_sid(&self, port: u16, protocol: u8) -> Result<SecurityId, anyhow::Error>;

    /// Returns the SID of the Infiniband partition key `pkey` on the subnet `subnet_prefix`.
    fn pkey_sid(&self, subnet_prefix: u64, pkey: u16) -> Result<SecurityId, anyhow::Error>;
}

/// Resolution state of a node's label. The SID is only carried by `Initialized`, so it can
/// never be observed while resolution is incomplete.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LabelState {
    /// No label has been resolved, or the last attempt failed.
    Invalid,
    /// A thread is resolving the label; other readers wait for it.
    Pending,
    /// The label was resolved while policy `generation` was active.
    Initialized { sid: SecurityId, generation: u32 },
}

/// Membership of a node in its mount's collection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NodeLink {
    /// Not (yet) part of any collection.
    Unlinked,
    /// Enumerable through the mount's collection under `slot`.
    Linked { slot: u64 },
    /// Removed from the collection; the record lives on only for readers that still hold it.
    Retiring,
}

struct LabelInner {
    state: LabelState,
    /// Number of failed resolution attempts, used to release waiters of a failed attempt.
    failures: u64,
}

/// The SELinux security structure for a filesystem node.
pub struct FsNodeLabel {
    node_id: NodeId,
    mount: Weak<MountLabel>,
    task_sid: SecurityId,
    class: FileClass,
    inner: Mutex<LabelInner>,
    resolved: Condvar,
    /// Only modified while the owning mount's collection lock is held.
    link: Mutex<NodeLink>,
}

impl std::fmt::Debug for FsNodeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsNodeLabel")
            .field("node_id", &self.node_id)
            .field("task_sid", &self.task_sid)
            .field("class", &self.class)
            .field("state", &self.state())
            .finish()
    }
}

impl FsNodeLabel {
    pub(crate) fn new(
        node_id: NodeId,
        mount: Weak<MountLabel>,
        task_sid: SecurityId,
        class: FileClass,
        state: LabelState,
    ) -> Self {
        Self {
            node_id,
            mount,
            task_sid,
            class,
            inner: Mutex::new(LabelInner { state, failures: 0 }),
            resolved: Condvar::new(),
            link: Mutex::new(NodeLink::Unlinked),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn task_sid(&self) -> SecurityId {
        self.task_sid
    }

    pub fn class(&self) -> FileClass {
        self.class
    }

    /// Returns the mount this node belongs to, unless it has already been torn down.
    pub fn mount(&self) -> Option<Arc<MountLabel>> {
        self.mount.upgrade()
    }

    pub fn state(&self) -> LabelState {
        self.inner.lock().state
    }

    /// Returns the resolved SID without attempting resolution. Does not check the generation,
    /// so the value may predate the active policy.
    pub fn cached_sid(&self) -> Option<SecurityId> {
        match self.inner.lock().state {
            LabelState::Initialized { sid, .. } => Some(sid),
            LabelState::Invalid | LabelState::Pending => None,
        }
    }

    /// Returns true once the node has been removed from its mount.
    pub fn is_retiring(&self) -> bool {
        *self.link.lock() == NodeLink::Retiring
    }

    pub(crate) fn link(&self) -> NodeLink {
        *self.link.lock()
    }

    pub(crate) fn set_link(&self, link: NodeLink) {
        *self.link.lock() = link;
    }

    /// Returns the SID of the node, resolving it first if it was never resolved, the last
    /// attempt failed, or it was resolved under a policy generation other than `generation`.
    /// Nodes on a mount whose labeling scheme is not yet known receive the "unlabeled" SID and
    /// remain `Invalid`.
    ///
    /// At most one thread resolves a given node at a time. Threads arriving while resolution is
    /// in progress block until it completes, then return its result; if it fails they all
    /// receive an error and the node reverts to `Invalid`, so that a later access retries.
    pub fn resolve(
        &self,
        resolver: &dyn LabelResolver,
        generation: u32,
    ) -> Result<SecurityId, LabelError> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                LabelState::Initialized { sid, generation: resolved_in } => {
                    if resolved_in == generation {
                        return Ok(sid);
                    }
                    debug!(
                        node = self.node_id,
                        resolved_in, generation, "re-resolving label from stale generation"
                    );
                    break;
                }
                LabelState::Pending => {
                    let failures = inner.failures;
                    self.resolved.wait(&mut inner);
                    if inner.failures != failures {
                        return Err(LabelError::ConcurrentResolutionFailed { node: self.node_id });
                    }
                }
                LabelState::Invalid => break,
            }
        }
        inner.state = LabelState::Pending;
        drop(inner);

        // Reverts the node to `Invalid` if the resolver unwinds.
        let mut pending = PendingResolution { label: self, completed: false };
        let result = self.compute_sid(resolver);
        pending.completed = true;

        let mut inner = self.inner.lock();
        if inner.state != LabelState::Pending {
            // An explicit label was applied while the resolver ran; it takes precedence.
            let state = inner.state;
            drop(inner);
            self.resolved.notify_all();
            return match (state, result) {
                (LabelState::Initialized { sid, .. }, _) => Ok(sid),
                (_, Ok(Resolution::Resolved(sid) | Resolution::Deferred(sid))) => Ok(sid),
                (_, Err(source)) => Err(LabelError::ResolutionFailed { node: self.node_id, source }),
            };
        }
        let result = match result {
            Ok(Resolution::Resolved(sid)) => {
                inner.state = LabelState::Initialized { sid, generation };
                Ok(sid)
            }
            Ok(Resolution::Deferred(sid)) => {
                inner.state = LabelState::Invalid;
                Ok(sid)
            }
            Err(source) => {
                inner.state = LabelState::Invalid;
                inner.failures = inner.failures.wrapping_add(1);
                Err(LabelError::ResolutionFailed { node: self.node_id, source })
            }
        };
        drop(inner);
        self.resolved.notify_all();
        result
    }

    /// Applies an explicitly chosen `sid`, e.g. after the node's stored label was rewritten.
    /// Any thread waiting on an in-flight resolution observes `sid`, and the in-flight result is
    /// discarded.
    pub fn set_sid(&self, sid: SecurityId, generation: u32) {
        self.inner.lock().state = LabelState::Initialized { sid, generation };
        self.resolved.notify_all();
    }

    /// Forgets a resolved label so that the next access resolves it again. Has no effect on a
    /// node whose resolution is in flight.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        if let LabelState::Initialized { .. } = inner.state {
            inner.state = LabelState::Invalid;
        }
    }

    fn compute_sid(&self, resolver: &dyn LabelResolver) -> Result<Resolution, anyhow::Error> {
        let mount = self.mount.upgrade().ok_or_else(|| anyhow::anyhow!("mount is gone"))?;
        let mount_state = mount.snapshot();
        if !mount_state.flags.contains(MountFlags::SB_INITIALIZED) {
            // Labeled once the mount's labeling scheme is known.
            return Ok(Resolution::Deferred(SecurityId::initial(InitialSid::Unlabeled)));
        }
        let sid = match mount_state.behavior {
            LabelingBehavior::Task => self.task_sid,
            LabelingBehavior::MountPoint => mount_state.mountpoint_sid.unwrap_or(mount_state.sid),
            LabelingBehavior::None => mount_state.sid,
            LabelingBehavior::Xattr
            | LabelingBehavior::Trans
            | LabelingBehavior::GenFs
            | LabelingBehavior::Native => {
                let request = FsNodeLabelRequest {
                    node_id: self.node_id,
                    mount_name: mount.name(),
                    task_sid: self.task_sid,
                    class: self.class,
                    behavior: mount_state.behavior,
                    mount_sid: mount_state.sid,
                    default_sid: mount_state.default_sid,
                };
                resolver.resolve_fs_node(&request)?.unwrap_or(mount_state.default_sid)
            }
        };
        Ok(Resolution::Resolved(sid))
    }
}

enum Resolution {
    /// The node's label.
    Resolved(SecurityId),
    /// The mount is not yet initialized; the SID applies to this access only.
    Deferred(SecurityId),
}

struct PendingResolution<'a> {
    label: &'a FsNodeLabel,
    completed: bool,
}

impl Drop for PendingResolution<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut inner = self.label.inner.lock();
        if inner.state == LabelState::Pending {
            inner.state = LabelState::Invalid;
            inner.failures = inner.failures.wrapping_add(1);
        }
        drop(inner);
        self.label.resolved.notify_all();
    }
}
