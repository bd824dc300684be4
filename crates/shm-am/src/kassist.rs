//! Kernel-assisted copies between address spaces.

use std::io;
use std::sync::OnceLock;

/// Copy bytes straight into or out of another process.
pub trait KernelCopy {
    /// Read `dst.len()` bytes at `addr` in process `pid`. Returns bytes read.
    fn read_remote(&self, pid: u32, addr: u64, dst: &mut [u8]) -> io::Result<usize>;

    /// Write `src` to `addr` in process `pid`. Returns bytes written.
    fn write_remote(&self, pid: u32, addr: u64, src: &[u8]) -> io::Result<usize>;

    /// Whether the mechanism works on this host.
    fn available(&self) -> bool;
}

/// Linux cross-memory attach (`process_vm_readv` / `process_vm_writev`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossMemoryAttach;

impl KernelCopy for CrossMemoryAttach {
    fn read_remote(&self, pid: u32, addr: u64, dst: &mut [u8]) -> io::Result<usize> {
        let local = libc::iovec {
            iov_base: dst.as_mut_ptr() as *mut libc::c_void,
            iov_len: dst.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: dst.len(),
        };
        // SAFETY: the local iovec covers `dst`; the kernel validates the remote one.
        let n = unsafe { libc::process_vm_readv(pid as libc::pid_t, &local, 1, &remote, 1, 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write_remote(&self, pid: u32, addr: u64, src: &[u8]) -> io::Result<usize> {
        let local = libc::iovec {
            iov_base: src.as_ptr() as *mut libc::c_void,
            iov_len: src.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: src.len(),
        };
        // SAFETY: the local iovec covers `src` and is only read.
        let n = unsafe { libc::process_vm_writev(pid as libc::pid_t, &local, 1, &remote, 1, 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn available(&self) -> bool {
        cma_available()
    }
}

/// Check once whether this process may use cross-memory attach.
pub fn cma_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let src: u64 = 0x5a5a_5a5a;
        let mut dst = [0u8; 8];
        let ok = CrossMemoryAttach
            .read_remote(std::process::id(), &src as *const u64 as u64, &mut dst)
            .map(|n| n == dst.len() && u64::from_ne_bytes(dst) == src)
            .unwrap_or(false);
        tracing::debug!(available = ok, "checked cross-memory attach");
        ok
    })
}
