//! Thread enumeration for the stop-the-world scan. readdir(3) may call
//! malloc, which would recurse into the allocator mid-scan, so the thread
//! directory is read with raw getdents64.

use crate::util;

/// Asynchronous stop signal delivered to every peer thread when a scan
/// starts; the handler runs the shard loop.
pub const STOP_SIGNAL: libc::c_int = libc::SIGUSR2;

// linux_dirent64 layout: ino (8) + off (8) + reclen (2) + type (1) + name.
const RECLEN_OFFSET: usize = 16;
const NAME_OFFSET: usize = 19;

pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Deliver the stop signal to one thread of this process. The result is
/// deliberately ignored: the thread may have exited already.
pub fn send_stop_signal(tgid: libc::pid_t, tid: libc::pid_t) {
    unsafe {
        libc::syscall(libc::SYS_tgkill, tgid, tid, STOP_SIGNAL);
    }
}

/// Invoke `f` for every thread id currently listed in /proc/self/task.
///
/// # Safety
/// Allocation-free, but must not run from a signal handler (opens a file
/// descriptor).
pub unsafe fn for_each_tid<F: FnMut(libc::pid_t)>(mut f: F) {
    let fd = libc::open(
        b"/proc/self/task\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_DIRECTORY,
    );
    if fd < 0 {
        util::report_and_abort("cannot open /proc/self/task");
    }
    let mut buf = [0u8; 1024];
    loop {
        let nread = libc::syscall(
            libc::SYS_getdents64,
            fd,
            buf.as_mut_ptr(),
            buf.len() as libc::c_uint,
        );
        if nread < 0 {
            libc::close(fd);
            util::report_and_abort("getdents64 failed on /proc/self/task");
        }
        if nread == 0 {
            break;
        }
        let nread = nread as usize;
        let mut pos = 0usize;
        while pos < nread {
            let reclen =
                u16::from_ne_bytes([buf[pos + RECLEN_OFFSET], buf[pos + RECLEN_OFFSET + 1]])
                    as usize;
            let name = &buf[pos + NAME_OFFSET..];
            if name[0] != b'.' {
                let mut tid: libc::pid_t = 0;
                for &b in name {
                    if !b.is_ascii_digit() {
                        break;
                    }
                    tid = tid * 10 + (b - b'0') as libc::pid_t;
                }
                f(tid);
            }
            pos += reclen;
        }
    }
    libc::close(fd);
}
