//! Classic BPF programs for `SECCOMP_MODE_FILTER`.
//!
//! The program returns `SECCOMP_RET_TRACE` for every listed syscall and
//! `SECCOMP_RET_ALLOW` for everything else, including calls made through a
//! foreign syscall ABI.

use crate::syscall::Syscall;

// Stable kernel ABI values from linux/filter.h and linux/seccomp.h.
const BPF_LD_W_ABS: u16 = 0x20; // BPF_LD | BPF_W | BPF_ABS
const BPF_JMP_JEQ_K: u16 = 0x15; // BPF_JMP | BPF_JEQ | BPF_K
const BPF_RET_K: u16 = 0x06; // BPF_RET | BPF_K

pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

// Offsets into struct seccomp_data.
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Builds a filter that traps `syscalls` to the tracer.
///
/// Layout: architecture check, syscall number load, one equality test per
/// syscall jumping forward to the trace return, then allow.
///
/// # Panics
///
/// Panics if more than 254 syscalls are listed, since jump offsets are 8 bits.
pub fn trace_filter(syscalls: &[Syscall]) -> Vec<libc::sock_filter> {
    let n = syscalls.len();
    assert!(n < 255, "too many syscalls for one filter: {n}");

    let mut program = Vec::with_capacity(n + 5);
    program.push(stmt(BPF_LD_W_ABS, OFFSET_ARCH));
    program.push(jump(BPF_JMP_JEQ_K, AUDIT_ARCH_X86_64, 0, (n + 1) as u8));
    program.push(stmt(BPF_LD_W_ABS, OFFSET_NR));
    for (i, syscall) in syscalls.iter().enumerate() {
        program.push(jump(
            BPF_JMP_JEQ_K,
            syscall.number() as u32,
            (n - i) as u8,
            0,
        ));
    }
    program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
    program.push(stmt(BPF_RET_K, SECCOMP_RET_TRACE));
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{CLIENT_SYSCALLS, NODE_SYSCALLS};

    /// Minimal interpreter for the instructions `trace_filter` emits.
    fn evaluate(program: &[libc::sock_filter], nr: u32, arch: u32) -> u32 {
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = program[pc];
            match insn.code {
                BPF_LD_W_ABS => {
                    acc = match insn.k {
                        OFFSET_NR => nr,
                        OFFSET_ARCH => arch,
                        other => panic!("unexpected load offset {other}"),
                    };
                    pc += 1;
                }
                BPF_JMP_JEQ_K => {
                    let skip = if acc == insn.k { insn.jt } else { insn.jf };
                    pc += 1 + usize::from(skip);
                }
                BPF_RET_K => return insn.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    #[test]
    fn traces_listed_syscalls_only() {
        let program = trace_filter(NODE_SYSCALLS);
        for syscall in NODE_SYSCALLS {
            assert_eq!(
                evaluate(&program, syscall.number() as u32, AUDIT_ARCH_X86_64),
                SECCOMP_RET_TRACE,
                "{syscall}"
            );
        }
        assert_eq!(
            evaluate(&program, libc::SYS_read as u32, AUDIT_ARCH_X86_64),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn client_filter_allows_file_io() {
        let program = trace_filter(CLIENT_SYSCALLS);
        assert_eq!(
            evaluate(&program, Syscall::Write.number() as u32, AUDIT_ARCH_X86_64),
            SECCOMP_RET_ALLOW
        );
        assert_eq!(
            evaluate(&program, Syscall::Connect.number() as u32, AUDIT_ARCH_X86_64),
            SECCOMP_RET_TRACE
        );
    }

    #[test]
    fn foreign_arch_is_allowed() {
        let program = trace_filter(NODE_SYSCALLS);
        assert_eq!(
            evaluate(&program, Syscall::Write.number() as u32, 0x4000_0003),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn empty_filter_allows_everything() {
        let program = trace_filter(&[]);
        assert_eq!(program.len(), 5);
        assert_eq!(evaluate(&program, 1, AUDIT_ARCH_X86_64), SECCOMP_RET_ALLOW);
    }
}
