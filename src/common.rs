// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::NonZeroU32;

macro_rules! enumerable_enum {
    ($(#[$meta:meta])* $name:ident {
        $($(#[$variant_meta:meta])* $variant:ident),*,
    }) => {
        $(#[$meta])*
        pub enum $name {
            $($(#[$variant_meta])* $variant),*
        }

        impl $name {
            pub fn all_variants() -> Vec<Self> {
                vec![
                    $($name::$variant),*
                ]
            }
        }
    }
}

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident {
        $($(#[$variant_meta:meta])* $variant:ident ($variant_name:literal)),*,
    }) => {
        enumerable_enum! {
            $(#[$meta])* $name {
                $($(#[$variant_meta])* $variant),*,
            }
        }

        impl $name {
            /// Returns the name of the class as it appears in policy.
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $variant_name),*
                }
            }
        }
    }
}

named_enum! {
    /// A well-known class in SELinux policy that has a particular meaning in policy enforcement
    /// hooks, and which label records carry to describe the object they label.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    ObjectClass {
        Process("process"),
        FileSystem("filesystem"),
        File("file"),
        Dir("dir"),
        Fd("fd"),
        Link("lnk_file"),
        Character("chr_file"),
        Block("blk_file"),
        SockFile("sock_file"),
        Fifo("fifo_file"),
        Socket("socket"),
        TcpSocket("tcp_socket"),
        UdpSocket("udp_socket"),
        RawIpSocket("rawip_socket"),
        SctpSocket("sctp_socket"),
        NetlinkSocket("netlink_socket"),
        PacketSocket("packet_socket"),
        KeySocket("key_socket"),
        UnixStreamSocket("unix_stream_socket"),
        UnixDgramSocket("unix_dgram_socket"),
        TunSocket("tun_socket"),
        Node("node"),
        NetIf("netif"),
        Ipc("ipc"),
        Sem("sem"),
        Msg("msg"),
        MsgQueue("msgq"),
        Shm("shm"),
        Key("key"),
        InfinibandPkey("infiniband_pkey"),
        InfinibandEndport("infiniband_endport"),
        Bpf("bpf"),
        PerfEvent("perf_event"),
    }
}

named_enum! {
    /// A well-known file-like class in SELinux policy. These are the classes a filesystem node
    /// label may carry.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    FileClass {
        File("file"),
        Dir("dir"),
        Link("lnk_file"),
        Character("chr_file"),
        Block("blk_file"),
        Socket("sock_file"),
        Fifo("fifo_file"),
    }
}

impl From<FileClass> for ObjectClass {
    fn from(file_class: FileClass) -> Self {
        match file_class {
            FileClass::File => Self::File,
            FileClass::Dir => Self::Dir,
            FileClass::Link => Self::Link,
            FileClass::Character => Self::Character,
            FileClass::Block => Self::Block,
            FileClass::Socket => Self::SockFile,
            FileClass::Fifo => Self::Fifo,
        }
    }
}

named_enum! {
    /// Classes of System V IPC objects.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    IpcClass {
        Ipc("ipc"),
        Sem("sem"),
        MsgQueue("msgq"),
        Shm("shm"),
    }
}

impl From<IpcClass> for ObjectClass {
    fn from(ipc_class: IpcClass) -> Self {
        match ipc_class {
            IpcClass::Ipc => Self::Ipc,
            IpcClass::Sem => Self::Sem,
            IpcClass::MsgQueue => Self::MsgQueue,
            IpcClass::Shm => Self::Shm,
        }
    }
}

named_enum! {
    /// Classes of sockets.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    SocketClass {
        Socket("socket"),
        Tcp("tcp_socket"),
        Udp("udp_socket"),
        RawIp("rawip_socket"),
        Sctp("sctp_socket"),
        Netlink("netlink_socket"),
        Packet("packet_socket"),
        Key("key_socket"),
        UnixStream("unix_stream_socket"),
        UnixDgram("unix_dgram_socket"),
        Tun("tun_socket"),
    }
}

impl From<SocketClass> for ObjectClass {
    fn from(socket_class: SocketClass) -> Self {
        match socket_class {
            SocketClass::Socket => Self::Socket,
            SocketClass::Tcp => Self::TcpSocket,
            SocketClass::Udp => Self::UdpSocket,
            SocketClass::RawIp => Self::RawIpSocket,
            SocketClass::Sctp => Self::SctpSocket,
            SocketClass::Netlink => Self::NetlinkSocket,
            SocketClass::Packet => Self::PacketSocket,
            SocketClass::Key => Self::KeySocket,
            SocketClass::UnixStream => Self::UnixStreamSocket,
            SocketClass::UnixDgram => Self::UnixDgramSocket,
            SocketClass::Tun => Self::TunSocket,
        }
    }
}

/// Initial Security Identifier (SID) values defined by the SELinux Reference Policy.
/// The presence and ordering of all values ensures that the numeric values match those output by
/// userspace policy tooling.
#[repr(u32)]
enum ReferenceInitialSid {
    Kernel = 1,
    Security,
    Unlabeled,
    Fs,
    File,
    _FileLabels,
    Init,
    AnySocket,
    Port,
    Netif,
    Netmsg,
    Node,
    _IgmpPacket,
    _IcmpSocket,
    _TcpSocket,
    _SysctlModprobe,
    _Sysctl,
    _SysctlFs,
    _SysctlKernel,
    _SysctlNet,
    _SysctlNetUnix,
    _SysctlVm,
    _SysctlDev,
    _Kmod,
    _Policy,
    _ScmpPacket,
    Devnull,

    FirstUnused,
}

/// Lowest Security Identifier value guaranteed not to be used to refer to an initial Security
/// Context.
pub const FIRST_UNUSED_SID: u32 = ReferenceInitialSid::FirstUnused as u32;

macro_rules! initial_sid_enum {
    ($(#[$meta:meta])* $name:ident {
        $($(#[$variant_meta:meta])* $variant:ident ($variant_name: literal)),*,
    }) => {
        $(#[$meta])*
        #[repr(u32)]
        pub enum $name {
            $($(#[$variant_meta])* $variant = ReferenceInitialSid::$variant as u32),*
        }

        impl $name {
            pub fn all_variants() -> Vec<Self> {
                vec![
                    $($name::$variant),*
                ]
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $variant_name),*
                }
            }
        }
    }
}

initial_sid_enum! {
/// Initial Security Identifier (SID) values used to label objects before, or in the absence of,
/// a policy-computed label.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    InitialSid {
        Kernel("kernel"),
        Security("security"),
        Unlabeled("unlabeled"),
        Fs("fs"),
        File("file"),
        Init("init"),
        AnySocket("any_socket"),
        Port("port"),
        Netif("netif"),
        Netmsg("netmsg"),
        Node("node"),
        Devnull("devnull"),
    }
}

impl InitialSid {
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    pub(crate) fn as_non_zero(&self) -> NonZeroU32 {
        // Reference numbering starts at 1.
        NonZeroU32::MIN.saturating_add(self.as_u32().saturating_sub(1))
    }
}
