// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::common::FileClass;
use crate::error::LabelError;
use crate::fs_node::{FsNodeLabel, LabelResolver, LabelState, NodeId, NodeLink};
use crate::{InitialSid, SecurityId};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// The scheme by which nodes on a mount are labeled, as selected by the policy's `fs_use_*` and
/// `genfscon` statements or by mount options.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LabelingBehavior {
    /// Labels are stored in the "security.selinux" extended attribute of each node.
    Xattr,
    /// Nodes are labeled by type transition from the creating task and the mount.
    Trans,
    /// Nodes take the label of the task that created them.
    Task,
    /// Labels are computed from the node's path by the policy's `genfscon` rules.
    GenFs,
    /// Every node takes the mount's label.
    None,
    /// Every node takes the label of the "context=" mount option.
    MountPoint,
    /// The filesystem supplies labels natively.
    Native,
}

bitflags::bitflags! {
    /// Records which labeling mount options were supplied, and the labeling state of the mount.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MountFlags: u16 {
        const FSCONTEXT = 0x01;
        const CONTEXT = 0x02;
        const ROOTCONTEXT = 0x04;
        const DEFCONTEXT = 0x08;
        const SB_LABEL_SUPPORT = 0x10;

        const SB_INITIALIZED = 0x0100;
        const SB_GENFS = 0x0400;
    }
}

/// Labeling-related mount parameters, as parsed by the caller from the mount data.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Name of the mounted filesystem or device.
    pub name: String,
    /// SID of the filesystem, as computed by the policy.
    pub fs_sid: SecurityId,
    /// "context=": label every node with this SID.
    pub context: Option<SecurityId>,
    /// "fscontext=": label the filesystem itself with this SID.
    pub fscontext: Option<SecurityId>,
    /// "defcontext=": label for nodes that carry no label of their own.
    pub defcontext: Option<SecurityId>,
    /// "rootcontext=": label for the root node.
    pub rootcontext: Option<SecurityId>,
    /// Labeling scheme selected by the policy. `None` if no policy is loaded yet.
    pub behavior: Option<LabelingBehavior>,
}

impl MountOptions {
    pub fn new(name: impl Into<String>, fs_sid: SecurityId) -> Self {
        Self {
            name: name.into(),
            fs_sid,
            context: None,
            fscontext: None,
            defcontext: None,
            rootcontext: None,
            behavior: None,
        }
    }
}

/// A copy of the labeling state of a mount.
#[derive(Clone, Debug, PartialEq)]
pub struct MountLabelState {
    /// SID of the filesystem itself.
    pub sid: SecurityId,
    /// Default SID for labeling nodes.
    pub default_sid: SecurityId,
    /// SID applied to every node with `MountPoint` labeling.
    pub mountpoint_sid: Option<SecurityId>,
    /// SID applied to the root node.
    pub root_sid: Option<SecurityId>,
    pub behavior: LabelingBehavior,
    pub flags: MountFlags,
}

/// Outcome of [`MountLabel::relabel_all`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RelabelSummary {
    /// Nodes whose label was resolved again.
    pub relabeled: usize,
    /// Nodes whose resolution failed; they are left `Invalid`.
    pub failed: usize,
    /// Nodes left `Invalid` because the mount's labeling scheme is not yet known.
    pub deferred: usize,
    /// Collection entries whose node had already been dropped.
    pub pruned: usize,
}

#[derive(Default)]
struct NodeCollection {
    next_slot: u64,
    nodes: BTreeMap<u64, Weak<FsNodeLabel>>,
    unmounted: bool,
}

/// The SELinux security structure for a mounted filesystem.
///
/// The mount owns the enumeration of the labels of its nodes, so that they can all be relabeled
/// when the policy changes. The enumeration holds only weak references: each node's label is
/// owned by the node.
pub struct MountLabel {
    name: String,
    state: Mutex<MountLabelState>,
    /// Lock order: `nodes` before any node's own lock.
    nodes: Mutex<NodeCollection>,
}

impl std::fmt::Debug for MountLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountLabel")
            .field("name", &self.name)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl MountLabel {
    /// Returns security state for a new mount, applying any labeling mount options.
    pub fn new(options: MountOptions) -> Arc<Self> {
        let mut flags = MountFlags::empty();
        let mut sid = options.fs_sid;
        let mut behavior = options.behavior;

        if let Some(fscontext) = options.fscontext {
            flags |= MountFlags::FSCONTEXT;
            sid = fscontext;
        }
        if let Some(context) = options.context {
            flags |= MountFlags::CONTEXT;
            behavior = Some(LabelingBehavior::MountPoint);
            if options.fscontext.is_none() {
                sid = context;
            }
        }
        if options.rootcontext.is_some() {
            flags |= MountFlags::ROOTCONTEXT;
        }
        if options.defcontext.is_some() {
            flags |= MountFlags::DEFCONTEXT;
        }
        if let Some(behavior) = behavior {
            flags |= behavior_flags(behavior) | MountFlags::SB_INITIALIZED;
        }

        Arc::new(Self {
            name: options.name,
            state: Mutex::new(MountLabelState {
                sid,
                default_sid: options
                    .defcontext
                    .unwrap_or_else(|| SecurityId::initial(InitialSid::File)),
                mountpoint_sid: options.context,
                root_sid: options.rootcontext,
                behavior: behavior.unwrap_or(LabelingBehavior::None),
                flags,
            }),
            nodes: Mutex::new(NodeCollection::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> MountLabelState {
        self.state.lock().clone()
    }

    pub fn sid(&self) -> SecurityId {
        self.state.lock().sid
    }

    pub fn default_sid(&self) -> SecurityId {
        self.state.lock().default_sid
    }

    pub fn mountpoint_sid(&self) -> Option<SecurityId> {
        self.state.lock().mountpoint_sid
    }

    pub fn behavior(&self) -> LabelingBehavior {
        self.state.lock().behavior
    }

    pub fn flags(&self) -> MountFlags {
        self.state.lock().flags
    }

    pub fn is_initialized(&self) -> bool {
        self.flags().contains(MountFlags::SB_INITIALIZED)
    }

    /// Completes labeling setup of a mount that was created before its labeling scheme was
    /// known. Labels explicitly chosen through mount options take precedence over `fs_sid`.
    /// Returns false if the mount was already initialized, in which case nothing changes.
    pub fn initialize(&self, behavior: LabelingBehavior, fs_sid: SecurityId) -> bool {
        let mut state = self.state.lock();
        if state.flags.contains(MountFlags::SB_INITIALIZED) {
            return false;
        }
        if !state.flags.intersects(MountFlags::FSCONTEXT | MountFlags::CONTEXT) {
            state.sid = fs_sid;
        }
        if !state.flags.contains(MountFlags::CONTEXT) {
            state.behavior = behavior;
        }
        let added = behavior_flags(state.behavior) | MountFlags::SB_INITIALIZED;
        state.flags |= added;
        debug!(mount = %self.name, behavior = ?state.behavior, "mount labeling initialized");
        true
    }

    /// Creates the label for node `node_id`, and links it into the mount's collection.
    /// If `sid` is supplied the label starts `Initialized` under `generation`, otherwise it is
    /// resolved on first access.
    pub fn create_node(
        self: &Arc<Self>,
        node_id: NodeId,
        task_sid: SecurityId,
        class: FileClass,
        sid: Option<(SecurityId, u32)>,
    ) -> Result<Arc<FsNodeLabel>, LabelError> {
        let state = match sid {
            Some((sid, generation)) => LabelState::Initialized { sid, generation },
            None => LabelState::Invalid,
        };
        let label =
            Arc::new(FsNodeLabel::new(node_id, Arc::downgrade(self), task_sid, class, state));

        let mut collection = self.nodes.lock();
        if collection.unmounted {
            return Err(LabelError::MountNotActive { mount: self.name.clone() });
        }
        let slot = collection.next_slot;
        collection.next_slot = slot.wrapping_add(1);
        collection.nodes.insert(slot, Arc::downgrade(&label));
        label.set_link(NodeLink::Linked { slot });
        Ok(label)
    }

    /// Creates the label for the root node of the mount, applying the "rootcontext=" option if
    /// it was supplied.
    pub fn create_root_node(
        self: &Arc<Self>,
        node_id: NodeId,
        task_sid: SecurityId,
        generation: u32,
    ) -> Result<Arc<FsNodeLabel>, LabelError> {
        let root_sid = self.state.lock().root_sid;
        self.create_node(node_id, task_sid, FileClass::Dir, root_sid.map(|sid| (sid, generation)))
    }

    /// Removes `label` from the collection. The label itself is reclaimed once its last holder
    /// drops it, so readers that still hold it keep seeing its last value.
    pub fn remove_node(&self, label: &FsNodeLabel) {
        let mut collection = self.nodes.lock();
        if let NodeLink::Linked { slot } = label.link() {
            collection.nodes.remove(&slot);
        }
        label.set_link(NodeLink::Retiring);
    }

    /// Returns the number of nodes still linked into the collection.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().nodes.len()
    }

    /// Resolves the label of every node on the mount again, e.g. following a policy change.
    ///
    /// The collection lock is held for the whole traversal, so nodes are neither added nor
    /// removed while it runs. Each node is resolved under its own lock, so concurrent lookups of
    /// a node's label wait for, and share, its new resolution. A node whose earlier in-flight
    /// resolution fails while the traversal waits on it is resolved once more.
    pub fn relabel_all(&self, resolver: &dyn LabelResolver, generation: u32) -> RelabelSummary {
        let mut summary = RelabelSummary::default();
        let mut collection = self.nodes.lock();
        debug!(mount = %self.name, nodes = collection.nodes.len(), generation, "relabeling mount");

        collection.nodes.retain(|_, node| match node.upgrade() {
            Some(label) => {
                label.invalidate();
                let result = match label.resolve(resolver, generation) {
                    Err(LabelError::ConcurrentResolutionFailed { .. }) => {
                        label.resolve(resolver, generation)
                    }
                    result => result,
                };
                match result {
                    Ok(_) => match label.state() {
                        LabelState::Initialized { .. } => summary.relabeled += 1,
                        LabelState::Invalid | LabelState::Pending => summary.deferred += 1,
                    },
                    Err(error) => {
                        warn!(mount = %self.name, node = label.node_id(), %error, "relabel failed");
                        summary.failed += 1;
                    }
                }
                true
            }
            None => {
                summary.pruned += 1;
                false
            }
        });
        summary
    }

    /// Detaches every remaining node and refuses further node creation. Returns the number of
    /// nodes that were still linked.
    pub fn drain(&self) -> usize {
        let mut collection = self.nodes.lock();
        collection.unmounted = true;
        let nodes = std::mem::take(&mut collection.nodes);
        for label in nodes.values().filter_map(Weak::upgrade) {
            label.set_link(NodeLink::Retiring);
        }
        debug!(mount = %self.name, nodes = nodes.len(), "drained mount");
        nodes.len()
    }
}

/// Returns the flags implied by labeling nodes with `behavior`.
fn behavior_flags(behavior: LabelingBehavior) -> MountFlags {
    match behavior {
        LabelingBehavior::Xattr => MountFlags::SB_LABEL_SUPPORT,
        LabelingBehavior::GenFs => MountFlags::SB_GENFS,
        _ => MountFlags::empty(),
    }
}
