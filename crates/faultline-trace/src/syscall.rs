//! The syscalls faultline intercepts, keyed by their x86_64 numbers.

use std::fmt;

/// An intercepted syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Syscall {
    Select,
    Poll,
    GetTimeOfDay,
    ClockGetTime,
    GetRandom,
    Open,
    OpenAt,
    Mknod,
    MknodAt,
    Creat,
    Close,
    Write,
    Rename,
    RenameAt,
    SyncFs,
    Fsync,
    FdataSync,
    Socket,
    Bind,
    GetSockName,
    GetPeerName,
    Accept,
    Accept4,
    Connect,
    SendTo,
    RecvFrom,
    Shutdown,
}

/// Syscalls trapped for node processes.
pub const NODE_SYSCALLS: &[Syscall] = &[
    Syscall::Select,
    Syscall::Poll,
    Syscall::GetTimeOfDay,
    Syscall::ClockGetTime,
    Syscall::GetRandom,
    Syscall::Open,
    Syscall::OpenAt,
    Syscall::Mknod,
    Syscall::MknodAt,
    Syscall::Creat,
    Syscall::Close,
    Syscall::Write,
    Syscall::Rename,
    Syscall::RenameAt,
    Syscall::SyncFs,
    Syscall::Fsync,
    Syscall::FdataSync,
    Syscall::Socket,
    Syscall::Bind,
    Syscall::GetSockName,
    Syscall::GetPeerName,
    Syscall::Accept,
    Syscall::Accept4,
    Syscall::Connect,
    Syscall::SendTo,
    Syscall::RecvFrom,
];

/// Syscalls trapped for client processes.
pub const CLIENT_SYSCALLS: &[Syscall] = &[
    Syscall::Socket,
    Syscall::Close,
    Syscall::Shutdown,
    Syscall::Connect,
    Syscall::SendTo,
    Syscall::RecvFrom,
];

impl Syscall {
    pub const fn number(self) -> i64 {
        match self {
            Self::Select => libc::SYS_select,
            Self::Poll => libc::SYS_poll,
            Self::GetTimeOfDay => libc::SYS_gettimeofday,
            Self::ClockGetTime => libc::SYS_clock_gettime,
            Self::GetRandom => libc::SYS_getrandom,
            Self::Open => libc::SYS_open,
            Self::OpenAt => libc::SYS_openat,
            Self::Mknod => libc::SYS_mknod,
            Self::MknodAt => libc::SYS_mknodat,
            Self::Creat => libc::SYS_creat,
            Self::Close => libc::SYS_close,
            Self::Write => libc::SYS_write,
            Self::Rename => libc::SYS_rename,
            Self::RenameAt => libc::SYS_renameat,
            Self::SyncFs => libc::SYS_syncfs,
            Self::Fsync => libc::SYS_fsync,
            Self::FdataSync => libc::SYS_fdatasync,
            Self::Socket => libc::SYS_socket,
            Self::Bind => libc::SYS_bind,
            Self::GetSockName => libc::SYS_getsockname,
            Self::GetPeerName => libc::SYS_getpeername,
            Self::Accept => libc::SYS_accept,
            Self::Accept4 => libc::SYS_accept4,
            Self::Connect => libc::SYS_connect,
            Self::SendTo => libc::SYS_sendto,
            Self::RecvFrom => libc::SYS_recvfrom,
            Self::Shutdown => libc::SYS_shutdown,
        }
    }

    /// Looks up an intercepted syscall by number.
    pub fn from_number(number: i64) -> Option<Self> {
        ALL.iter().copied().find(|s| s.number() == number)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Poll => "poll",
            Self::GetTimeOfDay => "gettimeofday",
            Self::ClockGetTime => "clock_gettime",
            Self::GetRandom => "getrandom",
            Self::Open => "open",
            Self::OpenAt => "openat",
            Self::Mknod => "mknod",
            Self::MknodAt => "mknodat",
            Self::Creat => "creat",
            Self::Close => "close",
            Self::Write => "write",
            Self::Rename => "rename",
            Self::RenameAt => "renameat",
            Self::SyncFs => "syncfs",
            Self::Fsync => "fsync",
            Self::FdataSync => "fdatasync",
            Self::Socket => "socket",
            Self::Bind => "bind",
            Self::GetSockName => "getsockname",
            Self::GetPeerName => "getpeername",
            Self::Accept => "accept",
            Self::Accept4 => "accept4",
            Self::Connect => "connect",
            Self::SendTo => "sendto",
            Self::RecvFrom => "recvfrom",
            Self::Shutdown => "shutdown",
        }
    }
}

const ALL: &[Syscall] = &[
    Syscall::Select,
    Syscall::Poll,
    Syscall::GetTimeOfDay,
    Syscall::ClockGetTime,
    Syscall::GetRandom,
    Syscall::Open,
    Syscall::OpenAt,
    Syscall::Mknod,
    Syscall::MknodAt,
    Syscall::Creat,
    Syscall::Close,
    Syscall::Write,
    Syscall::Rename,
    Syscall::RenameAt,
    Syscall::SyncFs,
    Syscall::Fsync,
    Syscall::FdataSync,
    Syscall::Socket,
    Syscall::Bind,
    Syscall::GetSockName,
    Syscall::GetPeerName,
    Syscall::Accept,
    Syscall::Accept4,
    Syscall::Connect,
    Syscall::SendTo,
    Syscall::RecvFrom,
    Syscall::Shutdown,
];

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn numbers_round_trip() {
        for &syscall in ALL {
            assert_eq!(Syscall::from_number(syscall.number()), Some(syscall));
        }
        assert_eq!(Syscall::from_number(libc::SYS_read), None);
    }

    #[test_case(Syscall::Write, 1)]
    #[test_case(Syscall::Poll, 7)]
    #[test_case(Syscall::Connect, 42)]
    #[test_case(Syscall::GetRandom, 318)]
    fn x86_64_numbers(syscall: Syscall, number: i64) {
        assert_eq!(syscall.number(), number);
    }

    #[test]
    fn client_set_is_network_only() {
        assert!(!CLIENT_SYSCALLS.contains(&Syscall::Write));
        assert!(!CLIENT_SYSCALLS.contains(&Syscall::ClockGetTime));
        assert!(CLIENT_SYSCALLS.contains(&Syscall::RecvFrom));
    }
}
