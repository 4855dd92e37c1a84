//! Architecture-neutral view of the syscall register file.

/// Syscall number, return value, arguments and stack pointer of a stopped
/// tracee.
///
/// Values are raw 64-bit register contents; helpers interpret them as the
/// signed quantities the kernel ABI uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    /// Syscall number as seen on entry. Writing `-1` skips the call.
    pub syscall: u64,
    /// Return value register. Only meaningful at syscall exit.
    pub ret: u64,
    pub args: [u64; 6],
    pub sp: u64,
}

impl Registers {
    pub fn syscall_number(&self) -> i64 {
        self.syscall as i64
    }

    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }

    /// Argument as a file descriptor (lower 32 bits, signed).
    pub fn fd_arg(&self, index: usize) -> i32 {
        self.args[index] as i32
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        self.args[index] = value;
    }

    /// Return value as the kernel reports it: negative values are `-errno`.
    pub fn return_value(&self) -> i64 {
        self.ret as i64
    }

    pub fn set_return_value(&mut self, value: i64) {
        self.ret = value as u64;
    }

    /// Overwrites the return value with `-errno`.
    pub fn set_errno(&mut self, errno: i32) {
        self.set_return_value(-i64::from(errno));
    }

    /// Makes the kernel skip the pending syscall.
    pub fn skip_syscall(&mut self) {
        self.syscall = u64::MAX;
    }

    pub fn is_skipped(&self) -> bool {
        self.syscall == u64::MAX
    }
}
