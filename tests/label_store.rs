// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use selinux_objsec::common::FileClass;
use selinux_objsec::fs_node::{FsNodeLabelRequest, LabelResolver, LabelState};
use selinux_objsec::mount::{LabelingBehavior, MountOptions};
use selinux_objsec::net::{IpProtocol, LabelCache, PortKey};
use selinux_objsec::task::{DenyFlags, TaskState};
use selinux_objsec::{LabelError, SecurityConfig, SecurityId, SecurityState};

use assert_matches::assert_matches;
use once_cell::sync::Lazy;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

static NODE_SID: Lazy<SecurityId> = Lazy::new(|| SecurityId::from_raw(42).unwrap());
static TASK_SID: Lazy<SecurityId> = Lazy::new(|| SecurityId::from_raw(100).unwrap());

/// Labels every node with `NODE_SID` after a short delay, counting calls.
#[derive(Default)]
struct SlowResolver {
    calls: AtomicUsize,
}

impl LabelResolver for SlowResolver {
    fn resolve_fs_node(
        &self,
        _request: &FsNodeLabelRequest<'_>,
    ) -> Result<Option<SecurityId>, anyhow::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        Ok(Some(*NODE_SID))
    }

    fn netif_sid(&self, _namespace: u64, _ifindex: i32) -> Result<SecurityId, anyhow::Error> {
        anyhow::bail!("no interface labels")
    }

    fn node_sid(&self, _address: IpAddr) -> Result<SecurityId, anyhow::Error> {
        anyhow::bail!("no node labels")
    }

    fn port_sid(&self, _port: u16, _protocol: u8) -> Result<SecurityId, anyhow::Error> {
        anyhow::bail!("no port labels")
    }

    fn pkey_sid(&self, _subnet_prefix: u64, _pkey: u16) -> Result<SecurityId, anyhow::Error> {
        anyhow::bail!("no pkey labels")
    }
}

fn security_state() -> (SecurityState, Arc<SlowResolver>) {
    let resolver = Arc::new(SlowResolver::default());
    (SecurityState::new(SecurityConfig::default(), resolver.clone()), resolver)
}

fn xattr_options() -> MountOptions {
    MountOptions {
        behavior: Some(LabelingBehavior::Xattr),
        ..MountOptions::new("ext4", SecurityId::from_raw(10).unwrap())
    }
}

#[test]
fn concurrent_first_access_shares_one_resolution() {
    let (state, resolver) = security_state();
    let task = TaskState::with_sid(*TASK_SID);
    let mount = state.on_mount(xattr_options());
    let node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();
    let barrier = Barrier::new(2);

    let sids: Vec<SecurityId> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    state.object_sid(&node).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(sids, vec![*NODE_SID, *NODE_SID]);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert_matches!(node.state(), LabelState::Initialized { sid, .. } if sid == *NODE_SID);
}

#[test]
fn deny_ptrace_survives_exec() {
    let (state, _resolver) = security_state();
    let task = state.on_task_create(None);
    state.set_deny_flag(&task, DenyFlags::DENY_PROCESS_PTRACE);
    state.set_deny_flag(&task, DenyFlags::DENY_PROCESS_PTRACE);

    state.on_exec(&task, *TASK_SID);
    let child = state.on_task_create(Some(&task));

    assert!(task.has_deny_flag(DenyFlags::DENY_PROCESS_PTRACE));
    assert!(child.has_deny_flag(DenyFlags::DENY_PROCESS_PTRACE));
    assert_eq!(task.deny_flags(), DenyFlags::DENY_PROCESS_PTRACE);
}

#[test]
fn reader_keeps_label_across_removal() {
    let (state, _resolver) = security_state();
    let task = TaskState::with_sid(*TASK_SID);
    let mount = state.on_mount(xattr_options());
    let node = state.on_fs_node_create(&mount, 1, &task, FileClass::File).unwrap();
    state.object_sid(&node).unwrap();

    let reader = Arc::clone(&node);
    state.on_fs_node_destroy(&node);
    drop(node);

    assert!(reader.is_retiring());
    assert_eq!(reader.cached_sid(), Some(*NODE_SID));
    assert_eq!(mount.node_count(), 0);
}

#[test]
fn port_lookup_requires_matching_protocol() {
    let cache = LabelCache::new("port", 8);
    let sid = SecurityId::from_raw(7).unwrap();
    cache.insert(PortKey { port: 8080, protocol: IpProtocol::TCP }, sid);

    assert_eq!(cache.lookup(&PortKey { port: 8080, protocol: IpProtocol::TCP }).unwrap(), sid);
    assert_matches!(
        cache.lookup(&PortKey { port: 8080, protocol: IpProtocol::UDP }),
        Err(LabelError::UnknownIdentity { .. })
    );
}

#[test]
fn relabel_races_with_create_and_destroy() {
    const WORKERS: u64 = 4;
    const NODES_PER_WORKER: u64 = 16;

    let (state, _resolver) = security_state();
    let task = TaskState::with_sid(*TASK_SID);
    let mount = state.on_mount(xattr_options());
    let done = AtomicBool::new(false);

    let kept: Vec<_> = std::thread::scope(|scope| {
        let relabeler = scope.spawn(|| {
            let mut passes = 0;
            while !done.load(Ordering::Acquire) || passes == 0 {
                state.relabel_all(&mount);
                passes += 1;
            }
            passes
        });

        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let (state, task, mount) = (&state, &task, &mount);
                scope.spawn(move || {
                    let mut kept = Vec::new();
                    for index in 0..NODES_PER_WORKER {
                        let node_id = worker * NODES_PER_WORKER + index;
                        let node =
                            state.on_fs_node_create(mount, node_id, task, FileClass::File).unwrap();
                        if index % 2 == 0 {
                            state.on_fs_node_destroy(&node);
                        } else {
                            kept.push(node);
                        }
                    }
                    kept
                })
            })
            .collect();

        let kept: Vec<_> =
            workers.into_iter().flat_map(|worker| worker.join().unwrap()).collect();
        done.store(true, Ordering::Release);
        assert!(relabeler.join().unwrap() > 0);
        kept
    });

    assert_eq!(mount.node_count(), kept.len());
    let summary = state.relabel_all(&mount);
    assert_eq!(summary.relabeled, kept.len());
    assert_eq!(summary.failed, 0);
    assert!(kept.iter().all(|node| node.cached_sid() == Some(*NODE_SID)));
}
