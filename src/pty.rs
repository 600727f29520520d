use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::{dup2, read, write};

use crate::syscall::fd_is_valid;
use crate::Error;
use crate::Pid;

/// Allocates a master PTY (`posix_openpt` + `grantpt` + `unlockpt`), returning the master
/// FD and the resolved slave device path.
pub fn open_master() -> Result<(OwnedFd, PathBuf), Error> {
    let master = posix_openpt(nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_NOCTTY)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let name = unsafe { ptsname_r(&master)? };
    Ok((master.into(), PathBuf::from(name)))
}

/// Opens the named slave device. Deliberately without `O_NOCTTY`: when the caller is a
/// session leader with no controlling terminal (as the child is, right after `setsid`),
/// this open implicitly attaches it as the controlling terminal.
pub fn open_slave(path: &Path) -> Result<OwnedFd, Error> {
    let fd = nix::fcntl::open(path, nix::fcntl::OFlag::O_RDWR, Mode::empty())?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Dups `slave` onto stdin/stdout/stderr. The original `slave` FD is dropped once the
/// dups exist unless it already occupies 0/1/2.
pub fn make_stdio(slave: OwnedFd) -> Result<(), Error> {
    let raw = slave.as_raw_fd();
    dup2(raw, 0)?;
    dup2(raw, 1)?;
    dup2(raw, 2)?;
    if raw > 2 {
        drop(slave);
    } else {
        std::mem::forget(slave);
    }
    Ok(())
}

struct RestoreTermios {
    fd: RawFd,
    saved: Termios,
}

impl Drop for RestoreTermios {
    fn drop(&mut self) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        if let Err(e) = termios::tcsetattr(fd, SetArg::TCSANOW, &self.saved) {
            tracing::warn!(target: "warden::pty", error = %e, "failed to restore terminal mode");
        }
    }
}

/// Puts the controlling terminal (stdin) into raw mode and shuttles bytes between it and
/// the master FD until either side reaches EOF. Terminal mode is restored on every exit
/// path via `RestoreTermios`'s `Drop`.
pub fn proxy(master: BorrowedFd) -> Result<(), Error> {
    let stdin_fd = unsafe { BorrowedFd::borrow_raw(0) };
    let restore = match termios::tcgetattr(stdin_fd) {
        Ok(original) => {
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            if let Err(e) = termios::tcsetattr(stdin_fd, SetArg::TCSANOW, &raw) {
                tracing::warn!(target: "warden::pty", error = %e, "failed to set raw mode");
                None
            } else {
                Some(RestoreTermios {
                    fd: 0,
                    saved: original,
                })
            }
        }
        Err(e) => {
            tracing::warn!(target: "warden::pty", error = %e, "stdin is not a terminal");
            None
        }
    };

    let mut buf = [0u8; 4096];
    loop {
        let mut fds = [
            PollFd::new(stdin_fd, PollFlags::POLLIN),
            PollFd::new(master, PollFlags::POLLIN),
        ];
        poll(&mut fds, PollTimeout::NONE)?;
        if fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN))
        {
            match read(0, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if write(master, &buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
        if fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
        {
            match read(master.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if write(unsafe { BorrowedFd::borrow_raw(1) }, &buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
        if !fd_is_valid(&master) {
            break;
        }
    }
    drop(restore);
    Ok(())
}

fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        let path = PathBuf::from(dir).join("warden");
        if std::fs::create_dir_all(&path).is_ok() {
            return path;
        }
    }
    for candidate in ["/run/warden", "/tmp/warden"] {
        let path = PathBuf::from(candidate);
        if std::fs::create_dir_all(&path).is_ok() {
            return path;
        }
    }
    PathBuf::from("/tmp")
}

/// Path of the detach/attach Unix socket for `pid`'s session.
pub fn socket_path(pid: Pid) -> PathBuf {
    runtime_dir().join(format!("{pid}.sock"))
}

/// Binds the session's well-known socket and, on the first (and only) connection, sends
/// the master FD over `SCM_RIGHTS` and closes the listener. Used by a detached session so
/// a later `--attach` invocation can reconnect.
pub fn serve(master: BorrowedFd, owner_pid: Pid) -> Result<(), Error> {
    let path = socket_path(owner_pid);
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let (stream, _) = listener.accept()?;
    let fds = [master.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(b"\0")];
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    drop(stream);
    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// Connects to `pid`'s broker socket and receives the master FD sent by `serve`.
pub fn recv(pid: Pid) -> Result<OwnedFd, Error> {
    let path = socket_path(pid);
    let stream = UnixStream::connect(&path)?;
    let mut buf = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )?;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err("no file descriptor received over broker socket".into())
}

