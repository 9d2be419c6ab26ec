//! Host-side syscall layers.
//!
//! The core routes every `ECALL` through the machine's handler table; this
//! module provides the standard layers an embedder usually wants. The
//! minimal layer covers process exit and console I/O; the newlib layer adds
//! the heap (brk) and the anonymous-mmap arena. There is deliberately no
//! filesystem or socket passthrough.

use memory::{PageAttr, BRK_MAX, PAGE_SIZE};

use crate::Machine;

pub mod errno {
    pub const EPERM: i64 = 1;
    pub const EBADF: i64 = 9;
    pub const ENOMEM: i64 = 12;
    pub const EINVAL: i64 = 22;
    pub const ENOSYS: i64 = 38;
}

// Linux RISC-V syscall numbers.
pub const SYS_CLOSE: u64 = 57;
pub const SYS_LSEEK: u64 = 62;
pub const SYS_READ: u64 = 63;
pub const SYS_WRITE: u64 = 64;
pub const SYS_EXIT: u64 = 93;
pub const SYS_EXIT_GROUP: u64 = 94;
pub const SYS_MREMAP: u64 = 163;
pub const SYS_GETPID: u64 = 172;
pub const SYS_GETUID: u64 = 174;
pub const SYS_GETEUID: u64 = 175;
pub const SYS_GETGID: u64 = 176;
pub const SYS_GETEGID: u64 = 177;
pub const SYS_BRK: u64 = 214;
pub const SYS_MUNMAP: u64 = 215;
pub const SYS_MMAP: u64 = 222;
pub const SYS_MPROTECT: u64 = 226;
pub const SYS_MADVISE: u64 = 233;

const PAGE: u64 = PAGE_SIZE as u64;

impl Machine {
    /// Exit, console I/O, and a handful of harmless stubs.
    pub fn setup_minimal_syscalls(&mut self) {
        // Stopping lets the surrounding simulate loop end; the exit code
        // stays readable in a0 via `return_value`.
        self.install_syscall_handler(SYS_EXIT, |m| {
            tracing::debug!(code = m.return_value(), "guest exit");
            m.stop();
            Ok(())
        });
        self.install_syscall_handler(SYS_EXIT_GROUP, |m| {
            tracing::debug!(code = m.return_value(), "guest exit_group");
            m.stop();
            Ok(())
        });
        self.install_syscall_handler(SYS_WRITE, |m| {
            let fd = m.sysarg(0) as i64;
            let addr = m.sysarg(1);
            let len = m.sysarg(2);
            tracing::trace!(fd, addr, len, "write");
            if fd == 1 || fd == 2 {
                m.sys_write_to(fd == 2, addr, len)?;
                m.set_result(len as i64);
            } else {
                m.set_result(-errno::EBADF);
            }
            Ok(())
        });
        // Reads report the requested length even when the host callback
        // fills fewer bytes; guests that loop on short reads never see
        // one. Surprising, but it is the observed contract.
        self.install_syscall_handler(SYS_READ, |m| {
            let fd = m.sysarg(0) as i64;
            let addr = m.sysarg(1);
            let len = m.sysarg(2);
            tracing::trace!(fd, addr, len, "read");
            if fd == 0 {
                m.sys_read_stdin(addr, len)?;
                m.set_result(len as i64);
            } else {
                m.set_result(-errno::EBADF);
            }
            Ok(())
        });
        self.install_syscall_handler(SYS_LSEEK, |m| {
            m.set_result(-errno::ENOSYS);
            Ok(())
        });
        // Closing the standard streams is accepted and ignored.
        self.install_syscall_handler(SYS_CLOSE, |m| {
            let fd = m.sysarg(0) as i64;
            tracing::trace!(fd, "close");
            m.set_result(if fd <= 2 { 0 } else { -errno::EBADF });
            Ok(())
        });
        for number in [SYS_GETPID, SYS_GETUID, SYS_GETEUID, SYS_GETGID, SYS_GETEGID] {
            self.install_syscall_handler(number, |m| {
                m.set_result(0);
                Ok(())
            });
        }
    }

    /// Minimal layer plus the heap: brk and the anonymous-mmap arena.
    pub fn setup_newlib_syscalls(&mut self) {
        self.setup_minimal_syscalls();

        self.install_syscall_handler(SYS_BRK, |m| {
            let requested = m.sysarg(0);
            let heap = m.memory.heap_base();
            let new_end = requested.clamp(heap, heap + BRK_MAX);
            tracing::trace!(requested, new_end, "brk");
            if new_end > heap && m.memory.set_page_attr(heap, new_end - heap, PageAttr::RW).is_err()
            {
                m.set_result(-errno::ENOMEM);
                return Ok(());
            }
            m.set_result(new_end as i64);
            Ok(())
        });

        self.install_syscall_handler(SYS_MMAP, |m| {
            let addr = m.sysarg(0);
            let len = m.sysarg(1);
            tracing::trace!(addr, len, prot = m.sysarg(2), flags = m.sysarg(3), "mmap");
            if addr % PAGE != 0 || len % PAGE != 0 || len == 0 {
                m.set_result(-errno::EINVAL);
                return Ok(());
            }
            let cursor = m.memory.mmap_cursor();
            // Only arena-sequential mappings are served; a fixed address
            // anywhere else fails explicitly instead of pretending the
            // range was mapped.
            if addr == 0 || addr == cursor {
                if m.memory.set_page_attr(cursor, len, PageAttr::RW).is_err() {
                    m.set_result(-errno::ENOMEM);
                    return Ok(());
                }
                m.set_result(cursor as i64);
                m.memory.set_mmap_cursor(cursor + len);
            } else {
                m.set_result(-errno::ENOMEM);
            }
            Ok(())
        });

        self.install_syscall_handler(SYS_MUNMAP, |m| {
            let addr = m.sysarg(0);
            let len = m.sysarg(1);
            tracing::trace!(addr, len, "munmap");
            m.memory.free_pages(addr, len);
            // Releasing the top mapping rewinds the arena cursor.
            if addr + len == m.memory.mmap_cursor() {
                let floor = m.memory.heap_base() + BRK_MAX;
                m.memory.set_mmap_cursor(addr.max(floor));
            }
            m.set_result(0);
            Ok(())
        });

        self.install_syscall_handler(SYS_MREMAP, |m| {
            let old_addr = m.sysarg(0);
            let old_size = m.sysarg(1);
            let new_size = m.sysarg(2);
            tracing::trace!(old_addr, old_size, new_size, "mremap");
            // Growing the most recent mapping in place is the common case;
            // everything else is refused.
            if old_addr + old_size == m.memory.mmap_cursor() && new_size % PAGE == 0 {
                if new_size > old_size
                    && m.memory
                        .set_page_attr(old_addr + old_size, new_size - old_size, PageAttr::RW)
                        .is_err()
                {
                    m.set_result(-errno::ENOMEM);
                    return Ok(());
                }
                m.memory.set_mmap_cursor(old_addr + new_size);
                m.set_result(old_addr as i64);
            } else {
                m.set_result(-errno::ENOMEM);
            }
            Ok(())
        });

        self.install_syscall_handler(SYS_MPROTECT, |m| {
            let addr = m.sysarg(0);
            let len = m.sysarg(1);
            let prot = m.sysarg(2);
            tracing::trace!(addr, len, prot, "mprotect");
            let mut attr = PageAttr::empty();
            if prot & 1 != 0 {
                attr |= PageAttr::READ;
            }
            if prot & 2 != 0 {
                attr |= PageAttr::WRITE;
            }
            if prot & 4 != 0 {
                attr |= PageAttr::EXEC;
            }
            match m.memory.set_page_attr(addr, len, attr) {
                Ok(()) => m.set_result(0),
                Err(_) => m.set_result(-errno::ENOMEM),
            }
            Ok(())
        });

        self.install_syscall_handler(SYS_MADVISE, |m| {
            let addr = m.sysarg(0);
            let len = m.sysarg(1);
            let advice = m.sysarg(2) as i64;
            tracing::trace!(addr, len, advice, "madvise");
            match advice {
                // MADV_NORMAL/RANDOM/SEQUENTIAL/WILLNEED
                0..=3 => m.set_result(0),
                // MADV_DONTNEED, MADV_FREE, MADV_REMOVE
                4 | 8 | 9 => {
                    m.memory.free_pages(addr, len);
                    m.set_result(0);
                }
                _ => m.set_result(-errno::EINVAL),
            }
            Ok(())
        });
    }
}
