// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Label stores for network objects: keyed caches of interface, node and port labels, and the
//! per-socket and per-tunnel security structures.

use crate::common::SocketClass;
use crate::error::LabelError;
use crate::sync::AtomicSecurityId;
use crate::SecurityId;

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Identifies a network interface.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NetifKey {
    /// Network namespace the interface belongs to.
    pub namespace: u64,
    pub ifindex: i32,
}

/// Identifies a network node (host address). The address family is part of `IpAddr`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeKey(pub IpAddr);

/// A transport protocol number, as carried in the IP header.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct IpProtocol(pub u8);

impl IpProtocol {
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
    pub const DCCP: Self = Self(33);
    pub const SCTP: Self = Self(132);
}

/// Identifies a port of a transport protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PortKey {
    pub port: u16,
    pub protocol: IpProtocol,
}

#[derive(Debug)]
struct CacheInner<K> {
    sids: HashMap<K, SecurityId>,
    /// Insertion order, oldest first.
    order: VecDeque<K>,
}

/// A bounded cache of labels of network objects, keyed by their identity.
///
/// Entries become visible with their SID already assigned. Once `capacity` is reached, inserting
/// a new identity evicts the oldest one.
#[derive(Debug)]
pub struct LabelCache<K> {
    name: &'static str,
    capacity: usize,
    inner: RwLock<CacheInner<K>>,
}

impl<K: Clone + Debug + Eq + Hash> LabelCache<K> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            inner: RwLock::new(CacheInner { sids: HashMap::new(), order: VecDeque::new() }),
        }
    }

    /// Returns the SID cached for `key`.
    pub fn lookup(&self, key: &K) -> Result<SecurityId, LabelError> {
        self.inner
            .read()
            .sids
            .get(key)
            .copied()
            .ok_or_else(|| LabelError::UnknownIdentity { identity: format!("{key:?}") })
    }

    /// Caches `sid` for `key`, replacing any SID already cached for it.
    pub fn insert(&self, key: K, sid: SecurityId) {
        let mut inner = self.inner.write();
        if inner.sids.insert(key.clone(), sid).is_some() {
            return;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.sids.remove(&evicted);
                debug!(cache = self.name, key = ?evicted, "evicted label");
            }
        }
    }

    /// Removes `key`, returning its SID if it was cached.
    pub fn remove(&self, key: &K) -> Option<SecurityId> {
        let mut inner = self.inner.write();
        let sid = inner.sids.remove(key)?;
        inner.order.retain(|cached| cached != key);
        Some(sid)
    }

    /// Replaces the SID cached for `key`. Fails if `key` is not cached.
    pub fn update_sid(&self, key: &K, sid: SecurityId) -> Result<(), LabelError> {
        match self.inner.write().sids.get_mut(key) {
            Some(cached) => {
                *cached = sid;
                Ok(())
            }
            None => Err(LabelError::UnknownIdentity { identity: format!("{key:?}") }),
        }
    }

    /// Removes every entry.
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.sids.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().sids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Labeling state of a socket with respect to NetLabel (CIPSO/CALIPSO) packet labeling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NetlabelState {
    #[default]
    Unset,
    /// Outgoing traffic must be labeled.
    Require,
    /// The socket is labeled.
    Labeled,
    /// Each outgoing packet is labeled individually.
    ReqSkb,
    /// The socket is labeled for a connected peer.
    ConnLabeled,
}

/// The SELinux security structure for a socket.
#[derive(Debug)]
pub struct SocketLabel {
    sid: SecurityId,
    class: SocketClass,
    peer_sid: AtomicSecurityId,
    netlabel: Mutex<NetlabelState>,
    /// Set once the first SCTP association is established; never cleared.
    associated: AtomicBool,
}

impl SocketLabel {
    pub fn new(sid: SecurityId, class: SocketClass) -> Self {
        Self {
            sid,
            class,
            peer_sid: AtomicSecurityId::default(),
            netlabel: Mutex::new(NetlabelState::default()),
            associated: AtomicBool::new(false),
        }
    }

    pub fn sid(&self) -> SecurityId {
        self.sid
    }

    pub fn class(&self) -> SocketClass {
        self.class
    }

    /// Returns the SID of the connected peer, once a labeled exchange has completed.
    pub fn peer_sid(&self) -> Option<SecurityId> {
        self.peer_sid.load(Ordering::Acquire)
    }

    pub fn set_peer_sid(&self, sid: SecurityId) {
        self.peer_sid.store(Some(sid), Ordering::Release);
    }

    pub fn netlabel_state(&self) -> NetlabelState {
        *self.netlabel.lock()
    }

    pub fn set_netlabel_state(&self, state: NetlabelState) {
        *self.netlabel.lock() = state;
    }

    /// Records an SCTP association with a peer labeled `peer_sid`. Returns true for the first
    /// association. A peer SID already recorded is kept, and is always recorded before the
    /// socket reports itself associated.
    pub fn on_association(&self, peer_sid: SecurityId) -> bool {
        self.peer_sid.set_if_unset(peer_sid, Ordering::AcqRel);
        !self.associated.swap(true, Ordering::AcqRel)
    }

    pub fn is_associated(&self) -> bool {
        self.associated.load(Ordering::Acquire)
    }

    /// Returns the label of a socket accepted on this listening socket from a peer labeled
    /// `peer_sid`.
    pub fn clone_for_accept(&self, peer_sid: Option<SecurityId>) -> Self {
        let accepted = Self::new(self.sid, self.class);
        if let Some(peer_sid) = peer_sid.or_else(|| self.peer_sid()) {
            accepted.set_peer_sid(peer_sid);
        }
        accepted
    }
}

/// The SELinux security structure for a TUN/TAP device.
#[derive(Debug)]
pub struct TunLabel {
    sid: AtomicSecurityId,
}

impl TunLabel {
    pub fn new(sid: SecurityId) -> Self {
        Self { sid: sid.into() }
    }

    pub fn sid(&self) -> Option<SecurityId> {
        self.sid.load(Ordering::Acquire)
    }

    /// Relabels the device with the SID of the task attaching to it.
    pub fn attach(&self, sid: SecurityId) {
        self.sid.store(Some(sid), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use std::net::Ipv4Addr;

    fn sid(raw: u32) -> SecurityId {
        SecurityId::from_raw(raw).unwrap()
    }

    #[test]
    fn port_lookup_distinguishes_protocols() {
        let cache = LabelCache::new("port", 16);
        cache.insert(PortKey { port: 80, protocol: IpProtocol::TCP }, sid(7));

        assert_eq!(cache.lookup(&PortKey { port: 80, protocol: IpProtocol::TCP }).unwrap(), sid(7));
        assert_matches!(
            cache.lookup(&PortKey { port: 80, protocol: IpProtocol::UDP }),
            Err(LabelError::UnknownIdentity { .. })
        );
    }

    #[test]
    fn insert_evicts_oldest() {
        let cache = LabelCache::new("netif", 2);
        let key = |ifindex| NetifKey { namespace: 0, ifindex };
        cache.insert(key(1), sid(10));
        cache.insert(key(2), sid(11));
        cache.insert(key(1), sid(12));
        cache.insert(key(3), sid(13));

        assert_eq!(cache.len(), 2);
        assert_matches!(cache.lookup(&key(1)), Err(LabelError::UnknownIdentity { .. }));
        assert_eq!(cache.lookup(&key(2)).unwrap(), sid(11));
        assert_eq!(cache.lookup(&key(3)).unwrap(), sid(13));
    }

    #[test]
    fn update_remove_and_flush() {
        let cache = LabelCache::new("node", 4);
        let local = NodeKey(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_matches!(cache.update_sid(&local, sid(5)), Err(LabelError::UnknownIdentity { .. }));

        cache.insert(local, sid(5));
        cache.update_sid(&local, sid(6)).unwrap();
        assert_eq!(cache.lookup(&local).unwrap(), sid(6));
        assert_eq!(cache.remove(&local), Some(sid(6)));
        assert_eq!(cache.remove(&local), None);

        cache.insert(local, sid(5));
        cache.flush();
        assert!(cache.is_empty());
    }

    #[test]
    fn first_association_sets_peer() {
        let socket = SocketLabel::new(sid(20), SocketClass::Sctp);
        assert_eq!(socket.peer_sid(), None);
        assert!(socket.on_association(sid(21)));
        assert!(!socket.on_association(sid(22)));
        assert!(socket.is_associated());
        assert_eq!(socket.peer_sid(), Some(sid(21)));
    }

    #[test]
    fn associated_socket_always_has_peer() {
        const THREADS: u32 = 4;
        let socket = SocketLabel::new(sid(20), SocketClass::Sctp);
        let firsts: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|index| {
                    let socket = &socket;
                    scope.spawn(move || {
                        let first = socket.on_association(sid(30 + index));
                        assert!(socket.peer_sid().is_some());
                        usize::from(first)
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).sum()
        });
        assert_eq!(firsts, 1);
        assert!(socket.is_associated());
    }

    #[test]
    fn accepted_socket_inherits_label() {
        let listener = SocketLabel::new(sid(20), SocketClass::Tcp);
        listener.set_netlabel_state(NetlabelState::Labeled);
        let accepted = listener.clone_for_accept(Some(sid(23)));
        assert_eq!(accepted.sid(), sid(20));
        assert_eq!(accepted.class(), SocketClass::Tcp);
        assert_eq!(accepted.peer_sid(), Some(sid(23)));
        assert_eq!(accepted.netlabel_state(), NetlabelState::Unset);
    }

    #[test]
    fn tun_attach_relabels() {
        let tun = TunLabel::new(sid(30));
        tun.attach(sid(31));
        assert_eq!(tun.sid(), Some(sid(31)));
    }
}
