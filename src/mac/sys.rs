//! Raw system calls.
//!
//! The loader must stay callable from images whose import graph never pulls
//! in libc, and it must be able to run while dyld's own state is mid-flight,
//! so the three kernel services it needs are issued as direct traps. XNU
//! reports failure in the carry flag; no errno is surfaced, callers only see
//! the conventional sentinel values.

use std::arch::asm;
use std::ffi::c_void;
use std::ptr::NonNull;

use mach2::vm_types::mach_vm_address_t;

// bsd/kern/syscalls.master, with the BSD syscall-class tag in the high bits
const SYS_MPROTECT: u64 = 0x0200_004a;
const SYS_MMAP: u64 = 0x0200_00c5;
const SYS_SHARED_REGION_CHECK_NP: u64 = 0x0200_0126;

pub const MAP_FAILED: *mut c_void = usize::MAX as *mut c_void;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// Anonymous private mapping, returning [`MAP_FAILED`] on error.
        pub unsafe fn mmap(
            addr: *mut c_void,
            len: u64,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: u64,
        ) -> *mut c_void {
            let ret: u64;
            let carry: u64;
            // SAFETY: direct trap; register assignment per the arm64 ABI
            unsafe {
                asm!(
                    "svc #0",
                    "cset {carry}, cs",
                    inlateout("x0") addr as u64 => ret,
                    inlateout("x1") len => _,
                    in("x2") prot as u64,
                    in("x3") flags as u64,
                    in("x4") fd as u64,
                    in("x5") offset,
                    in("x16") SYS_MMAP,
                    carry = lateout(reg) carry,
                    options(nostack),
                );
            }
            if carry != 0 { MAP_FAILED } else { ret as *mut c_void }
        }

        /// Changes protections on a mapped span; `-1` on error.
        pub unsafe fn mprotect(addr: *mut c_void, len: u64, prot: i32) -> i32 {
            let ret: u64;
            let carry: u64;
            // SAFETY: direct trap
            unsafe {
                asm!(
                    "svc #0",
                    "cset {carry}, cs",
                    inlateout("x0") addr as u64 => ret,
                    inlateout("x1") len => _,
                    in("x2") prot as u64,
                    in("x16") SYS_MPROTECT,
                    carry = lateout(reg) carry,
                    options(nostack),
                );
            }
            if carry != 0 { -1 } else { ret as i32 }
        }

        /// Asks the kernel where the dyld shared region is mapped; `0` when
        /// there is none (the out-parameter is untouched on error).
        pub fn shared_region_check_np() -> mach_vm_address_t {
            let mut address: mach_vm_address_t = 0;
            // SAFETY: the trap writes through x0 on success only
            unsafe {
                asm!(
                    "svc #0",
                    inlateout("x0") &mut address as *mut mach_vm_address_t as u64 => _,
                    inlateout("x1") 0u64 => _,
                    in("x16") SYS_SHARED_REGION_CHECK_NP,
                    options(nostack),
                );
            }
            address
        }
    } else {
        /// Anonymous private mapping, returning [`MAP_FAILED`] on error.
        pub unsafe fn mmap(
            addr: *mut c_void,
            len: u64,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: u64,
        ) -> *mut c_void {
            let ret: u64;
            let carry: u8;
            // SAFETY: direct trap; register assignment per the x86_64 ABI
            unsafe {
                asm!(
                    "syscall",
                    "setc {carry}",
                    inlateout("rax") SYS_MMAP => ret,
                    in("rdi") addr as u64,
                    in("rsi") len,
                    inlateout("rdx") prot as u64 => _,
                    in("r10") flags as u64,
                    in("r8") fd as u64,
                    in("r9") offset,
                    carry = lateout(reg_byte) carry,
                    lateout("rcx") _,
                    lateout("r11") _,
                    options(nostack),
                );
            }
            if carry != 0 { MAP_FAILED } else { ret as *mut c_void }
        }

        /// Changes protections on a mapped span; `-1` on error.
        pub unsafe fn mprotect(addr: *mut c_void, len: u64, prot: i32) -> i32 {
            let ret: u64;
            let carry: u8;
            // SAFETY: direct trap
            unsafe {
                asm!(
                    "syscall",
                    "setc {carry}",
                    inlateout("rax") SYS_MPROTECT => ret,
                    in("rdi") addr as u64,
                    in("rsi") len,
                    inlateout("rdx") prot as u64 => _,
                    carry = lateout(reg_byte) carry,
                    lateout("rcx") _,
                    lateout("r11") _,
                    options(nostack),
                );
            }
            if carry != 0 { -1 } else { ret as i32 }
        }

        /// Asks the kernel where the dyld shared region is mapped; `0` when
        /// there is none (the out-parameter is untouched on error).
        pub fn shared_region_check_np() -> mach_vm_address_t {
            let mut address: mach_vm_address_t = 0;
            // SAFETY: the trap writes through rdi on success only
            unsafe {
                asm!(
                    "syscall",
                    inlateout("rax") SYS_SHARED_REGION_CHECK_NP => _,
                    in("rdi") &mut address as *mut mach_vm_address_t as u64,
                    lateout("rcx") _,
                    lateout("r11") _,
                    lateout("rdx") _,
                    options(nostack),
                );
            }
            address
        }
    }
}

/// Fresh anonymous RW pages, or `None`. `extra_flags` carries `MAP_JIT` on
/// the modern pipeline.
pub unsafe fn anon_rw(len: usize, extra_flags: i32) -> Option<NonNull<u8>> {
    // SAFETY: anonymous mapping request; the result is never unmapped
    let p = unsafe {
        mmap(
            std::ptr::null_mut(),
            len as u64,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags,
            -1,
            0,
        )
    };
    if p == MAP_FAILED { None } else { NonNull::new(p.cast()) }
}
