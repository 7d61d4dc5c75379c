// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::common::{FileClass, IpcClass, SocketClass};
use crate::error::LabelError;
use crate::file::FileLabel;
use crate::fs_node::{FsNodeLabel, LabelResolver, NodeId, NodeLink};
use crate::misc::{
    BpfLabel, IbLabel, IpcLabel, KeyLabel, MsgLabel, PerfEventLabel, PkeyKey, PkeyLabel,
};
use crate::mount::{LabelingBehavior, MountLabel, MountOptions, RelabelSummary};
use crate::net::{IpProtocol, LabelCache, NetifKey, NodeKey, PortKey, SocketLabel, TunLabel};
use crate::task::{DenyFlags, ProcAttr, TaskState};
use crate::{InitialSid, SecurityId};

use std::fmt::Debug;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of entries held by each network label cache.
pub const DEFAULT_NET_CACHE_CAPACITY: usize = 1024;

/// Whether labels are computed at all.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Mode {
    /// Labels are resolved and stored.
    #[default]
    Enable,
    /// SELinux is not enabled: every object is labeled "unlabeled" and the resolver is never
    /// consulted.
    Disabled,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityConfig {
    pub mode: Mode,
    /// Maximum number of entries in each of the interface, node, port and partition key caches.
    pub net_cache_capacity: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { mode: Mode::default(), net_cache_capacity: DEFAULT_NET_CACHE_CAPACITY }
    }
}

/// Entry points through which kernel objects acquire, consult and drop their security labels.
pub struct SecurityState {
    config: SecurityConfig,
    resolver: Arc<dyn LabelResolver>,
    /// Incremented each time a new policy is loaded. Labels record the generation they were
    /// computed under.
    generation: AtomicU32,
    netif_cache: LabelCache<NetifKey>,
    node_cache: LabelCache<NodeKey>,
    port_cache: LabelCache<PortKey>,
    pkey_cache: LabelCache<PkeyKey>,
}

impl SecurityState {
    pub fn new(config: SecurityConfig, resolver: Arc<dyn LabelResolver>) -> Self {
        let capacity = config.net_cache_capacity;
        Self {
            config,
            resolver,
            generation: AtomicU32::new(0),
            netif_cache: LabelCache::new("netif", capacity),
            node_cache: LabelCache::new("node", capacity),
            port_cache: LabelCache::new("port", capacity),
            pkey_cache: LabelCache::new("pkey", capacity),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.mode == Mode::Enable
    }

    /// Executes `hook` if labels are being computed, otherwise returns `default()`.
    fn run_if_enabled_else<R>(&self, hook: impl FnOnce() -> R, default: impl FnOnce() -> R) -> R {
        if self.is_enabled() {
            hook()
        } else {
            default()
        }
    }

    pub fn policy_generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Records that a new policy was loaded. Cached network labels are discarded, and node and
    /// file labels computed under earlier policies are re-resolved on their next access.
    /// Returns the new policy generation.
    pub fn policy_reloaded(&self) -> u32 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.netif_cache.flush();
        self.node_cache.flush();
        self.port_cache.flush();
        self.pkey_cache.flush();
        info!(generation, "policy reloaded");
        generation
    }

    /// Returns the security state for a new task, inherited from `parent` if supplied.
    pub fn on_task_create(&self, parent: Option<&TaskState>) -> TaskState {
        self.run_if_enabled_else(|| TaskState::alloc(parent), TaskState::for_selinux_disabled)
    }

    pub fn current_subject_sid(&self, task: &TaskState) -> SecurityId {
        task.current_sid()
    }

    pub fn set_deny_flag(&self, task: &TaskState, flag: DenyFlags) {
        task.set_deny_flag(flag);
    }

    /// Returns the SID a task will run with after its next `exec()`, absent a policy type
    /// transition.
    pub fn exec_target_sid(&self, task: &TaskState) -> SecurityId {
        task.exec_sid().unwrap_or_else(|| task.current_sid())
    }

    /// Updates `task` on `exec()` into a program labeled by the policy with `new_sid`.
    pub fn on_exec(&self, task: &TaskState, new_sid: SecurityId) {
        self.run_if_enabled_else(|| task.on_exec_transition(new_sid), || ())
    }

    /// Returns the SID exposed through `/proc/<pid>/attr/<attr>`.
    pub fn get_procattr(&self, task: &TaskState, attr: ProcAttr) -> Option<SecurityId> {
        task.get_attr(attr)
    }

    /// Writes `/proc/<pid>/attr/<attr>`.
    pub fn set_procattr(
        &self,
        task: &TaskState,
        attr: ProcAttr,
        sid: Option<SecurityId>,
    ) -> Result<(), LabelError> {
        task.set_attr(attr, sid)
    }

    /// Returns the security state for a new mount.
    pub fn on_mount(&self, options: MountOptions) -> Arc<MountLabel> {
        let mount = MountLabel::new(options);
        debug!(mount = %mount.name(), initialized = mount.is_initialized(), "mount created");
        mount
    }

    /// Completes labeling setup of `mount` once the policy has chosen its labeling scheme, and
    /// labels the nodes that were created before then.
    pub fn initialize_mount(
        &self,
        mount: &MountLabel,
        behavior: LabelingBehavior,
        fs_sid: SecurityId,
    ) -> RelabelSummary {
        if !mount.initialize(behavior, fs_sid) {
            return RelabelSummary::default();
        }
        self.relabel_all(mount)
    }

    /// Detaches every node label from `mount` as it is unmounted.
    pub fn on_unmount(&self, mount: &MountLabel) -> usize {
        mount.drain()
    }

    pub fn mount_default_sid(&self, mount: &MountLabel) -> SecurityId {
        mount.default_sid()
    }

    /// Returns the label for a node created by `creator`. A SID chosen by the creator through
    /// `/proc/<pid>/attr/fscreate` is applied immediately, otherwise the label is resolved on
    /// first access.
    pub fn on_fs_node_create(
        &self,
        mount: &Arc<MountLabel>,
        node_id: NodeId,
        creator: &TaskState,
        class: FileClass,
    ) -> Result<Arc<FsNodeLabel>, LabelError> {
        let initial_sid = self.run_if_enabled_else(
            || creator.fscreate_sid(),
            || Some(SecurityId::initial(InitialSid::Unlabeled)),
        );
        let generation = self.policy_generation();
        mount.create_node(
            node_id,
            creator.current_sid(),
            class,
            initial_sid.map(|sid| (sid, generation)),
        )
    }

    /// Removes `label` from its mount as the node is destroyed.
    pub fn on_fs_node_destroy(&self, label: &FsNodeLabel) {
        match label.mount() {
            Some(mount) => mount.remove_node(label),
            None => label.set_link(NodeLink::Retiring),
        }
    }

    /// Returns the SID of a filesystem node, resolving it if necessary.
    pub fn object_sid(&self, label: &FsNodeLabel) -> Result<SecurityId, LabelError> {
        self.run_if_enabled_else(
            || label.resolve(self.resolver.as_ref(), self.policy_generation()),
            || Ok(SecurityId::initial(InitialSid::Unlabeled)),
        )
    }

    /// Applies `sid` to a node whose stored label was rewritten.
    pub fn set_object_sid(&self, label: &FsNodeLabel, sid: SecurityId) {
        label.set_sid(sid, self.policy_generation());
    }

    /// Re-resolves the label of every node on `mount` under the active policy.
    pub fn relabel_all(&self, mount: &MountLabel) -> RelabelSummary {
        if !self.is_enabled() {
            return RelabelSummary::default();
        }
        let generation = self.policy_generation();
        let summary = mount.relabel_all(self.resolver.as_ref(), generation);
        debug!(
            mount = %mount.name(),
            relabeled = summary.relabeled,
            failed = summary.failed,
            pruned = summary.pruned,
            "relabel complete"
        );
        summary
    }

    /// Returns the label of a file opened by `task` on the node labeled by `node`.
    pub fn on_file_open(
        &self,
        task: &TaskState,
        node: &FsNodeLabel,
    ) -> Result<FileLabel, LabelError> {
        let node_sid = self.object_sid(node)?;
        Ok(FileLabel::new(task.current_sid(), node_sid, self.policy_generation()))
    }

    /// Returns the SID of the node underlying `file`, refreshing it if the policy has changed
    /// since it was last observed.
    pub fn file_node_sid(
        &self,
        file: &FileLabel,
        node: &FsNodeLabel,
    ) -> Result<SecurityId, LabelError> {
        let generation = self.policy_generation();
        match file.revalidate(generation) {
            Err(LabelError::StaleGeneration { .. }) => {
                let node_sid = self.object_sid(node)?;
                file.refresh(node_sid, generation);
                Ok(node_sid)
            }
            result => result,
        }
    }

    fn creator_sid(&self, task: &TaskState, chosen: Option<SecurityId>) -> SecurityId {
        self.run_if_enabled_else(
            || chosen.unwrap_or_else(|| task.current_sid()),
            || SecurityId::initial(InitialSid::Unlabeled),
        )
    }

    /// Returns the label of a socket created by `task`, honoring `/proc/<pid>/attr/sockcreate`.
    pub fn on_socket_create(&self, task: &TaskState, class: SocketClass) -> SocketLabel {
        SocketLabel::new(self.creator_sid(task, task.sockcreate_sid()), class)
    }

    pub fn on_tun_create(&self, task: &TaskState) -> TunLabel {
        TunLabel::new(self.creator_sid(task, None))
    }

    pub fn on_ipc_create(&self, task: &TaskState, class: IpcClass) -> IpcLabel {
        IpcLabel::create(self.creator_sid(task, None), class)
    }

    pub fn on_msg_create(&self, task: &TaskState) -> MsgLabel {
        MsgLabel::create(self.creator_sid(task, None))
    }

    /// Returns the label of a key created by `task`, honoring `/proc/<pid>/attr/keycreate`.
    pub fn on_key_create(&self, task: &TaskState) -> KeyLabel {
        KeyLabel::create(self.creator_sid(task, task.keycreate_sid()))
    }

    pub fn on_ib_create(&self, task: &TaskState) -> IbLabel {
        IbLabel::create(self.creator_sid(task, None))
    }

    pub fn on_bpf_create(&self, task: &TaskState) -> BpfLabel {
        BpfLabel::create(self.creator_sid(task, None))
    }

    pub fn on_perf_event_create(&self, task: &TaskState) -> PerfEventLabel {
        PerfEventLabel::create(self.creator_sid(task, None))
    }

    /// Returns the label of the Infiniband partition key `pkey` on subnet `subnet_prefix`.
    pub fn on_pkey_create(&self, subnet_prefix: u64, pkey: u16) -> Result<PkeyLabel, LabelError> {
        let key = PkeyKey { subnet_prefix, pkey };
        Ok(PkeyLabel::create(key, self.pkey_sid(subnet_prefix, pkey)?))
    }

    /// Returns the SID of the network interface `ifindex` in `namespace`.
    pub fn netif_sid(&self, namespace: u64, ifindex: i32) -> Result<SecurityId, LabelError> {
        self.cached_lookup(&self.netif_cache, NetifKey { namespace, ifindex }, |resolver| {
            resolver.netif_sid(namespace, ifindex)
        })
    }

    /// Returns the SID of the host `address`.
    pub fn node_sid(&self, address: IpAddr) -> Result<SecurityId, LabelError> {
        self.cached_lookup(&self.node_cache, NodeKey(address), |resolver| {
            resolver.node_sid(address)
        })
    }

    pub fn port_sid(&self, port: u16, protocol: IpProtocol) -> Result<SecurityId, LabelError> {
        self.cached_lookup(&self.port_cache, PortKey { port, protocol }, |resolver| {
            resolver.port_sid(port, protocol.0)
        })
    }

    pub fn pkey_sid(&self, subnet_prefix: u64, pkey: u16) -> Result<SecurityId, LabelError> {
        self.cached_lookup(&self.pkey_cache, PkeyKey { subnet_prefix, pkey }, |resolver| {
            resolver.pkey_sid(subnet_prefix, pkey)
        })
    }

    /// Forgets the label of interface `ifindex`, e.g. when the interface is removed.
    pub fn on_netif_down(&self, namespace: u64, ifindex: i32) {
        self.netif_cache.remove(&NetifKey { namespace, ifindex });
    }

    fn cached_lookup<K: Clone + Debug + Eq + Hash>(
        &self,
        cache: &LabelCache<K>,
        key: K,
        compute: impl FnOnce(&dyn LabelResolver) -> Result<SecurityId, anyhow::Error>,
    ) -> Result<SecurityId, LabelError> {
        if !self.is_enabled() {
            return Ok(SecurityId::initial(InitialSid::Unlabeled));
        }
        if let Ok(sid) = cache.lookup(&key) {
            return Ok(sid);
        }
        let sid = compute(self.resolver.as_ref())
            .map_err(|source| LabelError::LookupFailed { identity: format!("{key:?}"), source })?;
        cache.insert(key, sid);
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_node::testing::FakeResolver;
    use crate::fs_node::LabelState;

    use assert_matches::assert_matches;
    use std::net::Ipv4Addr;

    fn sid(raw: u32) -> SecurityId {
        SecurityId::from_raw(raw).unwrap()
    }

    fn security_state(mode: Mode, resolver: FakeResolver) -> (SecurityState, Arc<FakeResolver>) {
        let resolver = Arc::new(resolver);
        let config = SecurityConfig { mode, ..SecurityConfig::default() };
        (SecurityState::new(config, resolver.clone()), resolver)
    }

    fn xattr_mount(state: &SecurityState) -> Arc<MountLabel> {
        state.on_mount(MountOptions {
            behavior: Some(LabelingBehavior::Xattr),
            ..MountOptions::new("ext4", sid(10))
        })
    }

    #[test]
    fn disabled_mode_hands_out_unlabeled() {
        let (state, resolver) = security_state(Mode::Disabled, FakeResolver::returning(sid(42)));
        let unlabeled = SecurityId::initial(InitialSid::Unlabeled);

        let task = state.on_task_create(None);
        assert_eq!(state.current_subject_sid(&task), unlabeled);

        let mount = xattr_mount(&state);
        let node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();
        assert_eq!(state.object_sid(&node).unwrap(), unlabeled);
        assert_eq!(state.on_socket_create(&task, SocketClass::Tcp).sid(), unlabeled);
        assert_eq!(state.port_sid(80, IpProtocol::TCP).unwrap(), unlabeled);
        assert_eq!(resolver.calls(), 0);
    }

    #[test]
    fn node_created_with_fscreate_is_initialized() {
        let (state, resolver) = security_state(Mode::Enable, FakeResolver::returning(sid(42)));
        let task = TaskState::with_sid(sid(20));
        task.set_attr(ProcAttr::FsCreate, Some(sid(21))).unwrap();

        let mount = xattr_mount(&state);
        let node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();
        assert_eq!(node.state(), LabelState::Initialized { sid: sid(21), generation: 0 });
        assert_eq!(state.object_sid(&node).unwrap(), sid(21));
        assert_eq!(resolver.calls(), 0);
    }

    #[test]
    fn policy_reload_re_resolves_nodes() {
        let (state, resolver) = security_state(Mode::Enable, FakeResolver::returning(sid(42)));
        let task = TaskState::with_sid(sid(20));
        let mount = xattr_mount(&state);
        let node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();
        assert_eq!(state.object_sid(&node).unwrap(), sid(42));

        resolver.node_sids.lock().insert(1, Some(sid(43)));
        assert_eq!(state.policy_reloaded(), 1);
        assert_eq!(state.object_sid(&node).unwrap(), sid(43));
        assert_eq!(resolver.calls(), 2);
    }

    #[test]
    fn destroyed_node_leaves_mount() {
        let (state, _resolver) = security_state(Mode::Enable, FakeResolver::returning(sid(42)));
        let task = TaskState::with_sid(sid(20));
        let mount = xattr_mount(&state);
        let node = state.on_fs_node_create(&mount, 1, &task, FileClass::Dir).unwrap();
        assert_eq!(mount.node_count(), 1);

        state.on_fs_node_destroy(&node);
        assert_eq!(mount.node_count(), 0);
        assert!(node.is_retiring());
    }

    #[test]
    fn file_label_follows_policy_reload() {
        let (state, resolver) = security_state(Mode::Enable, FakeResolver::returning(sid(42)));
        let task = TaskState::with_sid(sid(20));
        let mount = xattr_mount(&state);
        let node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();

        let file = state.on_file_open(&task, &node).unwrap();
        assert_eq!(file.sid(), sid(20));
        assert_eq!(state.file_node_sid(&file, &node).unwrap(), sid(42));

        resolver.node_sids.lock().insert(1, Some(sid(43)));
        state.policy_reloaded();
        assert_eq!(state.file_node_sid(&file, &node).unwrap(), sid(43));
        assert_eq!(file.generation(), 1);
    }

    #[test]
    fn per_purpose_creation_sids() {
        let (state, _resolver) = security_state(Mode::Enable, FakeResolver::default());
        let task = TaskState::with_sid(sid(20));
        state.set_procattr(&task, ProcAttr::SockCreate, Some(sid(22))).unwrap();
        state.set_procattr(&task, ProcAttr::KeyCreate, Some(sid(23))).unwrap();

        assert_eq!(state.on_socket_create(&task, SocketClass::Udp).sid(), sid(22));
        assert_eq!(state.on_key_create(&task).sid(), sid(23));
        assert_eq!(state.on_msg_create(&task).sid(), sid(20));
        assert_eq!(state.on_ipc_create(&task, IpcClass::Shm).sid(), sid(20));
        assert_eq!(state.on_tun_create(&task).sid(), Some(sid(20)));
        assert_eq!(state.on_ib_create(&task).sid(), sid(20));
        assert_eq!(state.on_bpf_create(&task).sid(), sid(20));
        assert_eq!(state.on_perf_event_create(&task).sid(), sid(20));
    }

    #[test]
    fn exec_clears_per_purpose_sids_but_keeps_deny_flags() {
        let (state, _resolver) = security_state(Mode::Enable, FakeResolver::default());
        let task = state.on_task_create(None);
        state.set_procattr(&task, ProcAttr::Exec, Some(sid(30))).unwrap();
        state.set_deny_flag(&task, DenyFlags::DENY_PROCESS_PTRACE);

        let target = state.exec_target_sid(&task);
        assert_eq!(target, sid(30));
        state.on_exec(&task, target);

        assert_eq!(state.current_subject_sid(&task), sid(30));
        assert_eq!(
            state.get_procattr(&task, ProcAttr::Previous),
            Some(SecurityId::initial(InitialSid::Kernel))
        );
        assert_eq!(state.get_procattr(&task, ProcAttr::Exec), None);
        assert!(task.has_deny_flag(DenyFlags::DENY_PROCESS_PTRACE));
    }

    #[test]
    fn network_labels_are_cached_until_reload() {
        let (state, _resolver) = security_state(Mode::Enable, FakeResolver::default());
        let address = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1));

        assert_eq!(state.netif_sid(0, 2).unwrap(), SecurityId::initial(InitialSid::Netif));
        assert_eq!(state.node_sid(address).unwrap(), SecurityId::initial(InitialSid::Node));
        assert_eq!(
            state.port_sid(443, IpProtocol::TCP).unwrap(),
            SecurityId::initial(InitialSid::Port)
        );
        assert_eq!(state.on_pkey_create(0xfe80, 1).unwrap().pkey(), 1);
        assert_eq!(state.netif_cache.len(), 1);
        assert_eq!(state.port_cache.len(), 1);

        state.on_netif_down(0, 2);
        assert!(state.netif_cache.is_empty());

        state.policy_reloaded();
        assert!(state.node_cache.is_empty());
        assert!(state.port_cache.is_empty());
        assert!(state.pkey_cache.is_empty());
    }

    #[test]
    fn failed_network_lookup_is_not_cached() {
        let (state, _resolver) = security_state(Mode::Enable, FakeResolver::failing());
        assert_matches!(
            state.port_sid(22, IpProtocol::TCP),
            Err(LabelError::LookupFailed { .. })
        );
        assert!(state.port_cache.is_empty());
    }

    #[test]
    fn initialize_mount_labels_pending_nodes() {
        let (state, resolver) = security_state(Mode::Enable, FakeResolver::returning(sid(42)));
        let task = TaskState::with_sid(sid(20));
        let mount = state.on_mount(MountOptions::new("tmpfs", sid(10)));
        let node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();
        assert_eq!(state.object_sid(&node).unwrap(), SecurityId::initial(InitialSid::Unlabeled));

        let summary = state.initialize_mount(&mount, LabelingBehavior::Xattr, sid(11));
        assert_eq!(summary.relabeled, 1);
        assert_eq!(node.cached_sid(), Some(sid(42)));
        assert_eq!(resolver.calls(), 1);
        assert_eq!(
            state.initialize_mount(&mount, LabelingBehavior::Xattr, sid(11)),
            RelabelSummary::default()
        );
    }

    #[test]
    fn unmount_refuses_new_nodes() {
        let (state, _resolver) = security_state(Mode::Enable, FakeResolver::default());
        let task = TaskState::with_sid(sid(20));
        let mount = xattr_mount(&state);
        let _node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();
        assert_eq!(state.mount_default_sid(&mount), SecurityId::initial(InitialSid::File));
        assert_eq!(state.on_unmount(&mount), 1);
        assert_matches!(
            state.on_fs_node_create(&mount, 2, &task, FileClass::File),
            Err(LabelError::MountNotActive { .. })
        );
    }
}
