use std::fs::{read_dir, File};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::{errno::Errno, libc::syscall};

use crate::Error;

pub type Pid = nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    /// Deliver SIGCHLD to the caller on exit, so the new process is waitable like an
    /// ordinary child even though it was created via `clone3` rather than `fork`.
    pub fn flag_exit_sigchld(&mut self) {
        self.exit_signal = nix::sys::signal::Signal::SIGCHLD as u64;
    }

    pub fn flag_newuser(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUSER as u64;
    }

    pub fn flag_newns(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNS as u64;
    }

    pub fn flag_newpid(&mut self) {
        self.flags |= nix::libc::CLONE_NEWPID as u64;
    }

    pub fn flag_newnet(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNET as u64;
    }

    pub fn flag_newipc(&mut self) {
        self.flags |= nix::libc::CLONE_NEWIPC as u64;
    }

    pub fn flag_newuts(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUTS as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

/// # Safety
/// The caller must ensure the child path returns to a valid control-flow point without
/// unwinding across the `clone3` boundary -- the child side has no Rust stack frames to
/// unwind back into.
pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> Result<CloneResult, Errno> {
    let res = syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

pub(crate) struct Pipe {
    rx: File,
    tx: File,
}

impl Pipe {
    pub fn rx(self) -> impl Read {
        drop(self.tx);
        self.rx
    }

    pub fn tx(self) -> impl Write {
        drop(self.rx);
        self.tx
    }
}

pub(crate) fn new_pipe() -> Result<Pipe, Error> {
    let (rx, tx) = nix::unistd::pipe()?;
    let rx = unsafe { File::from_raw_fd(rx) };
    let tx = unsafe { File::from_raw_fd(tx) };
    Ok(Pipe { rx, tx })
}

pub(crate) fn read_ok(mut rx: impl Read) -> Result<(), Error> {
    Ok(rx.read_exact(&mut [0; 1])?)
}

pub(crate) fn write_ok(mut tx: impl Write) -> Result<(), Error> {
    Ok(tx.write_all(&[0])?)
}

pub(crate) struct OwnedPid(Option<Pid>);

impl OwnedPid {
    pub unsafe fn from_raw(pid: Pid) -> Self {
        Self(Some(pid))
    }

    pub fn as_raw(&self) -> Pid {
        self.0.unwrap()
    }
}

impl Drop for OwnedPid {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
        }
    }
}

pub(crate) fn ignore_kind(
    result: std::io::Result<()>,
    kind: std::io::ErrorKind,
) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            if err.kind() == kind {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

/// Close every open file descriptor numbered `from` or above. Run in the child right
/// before exec so no FD private to the launcher (pipes, the cgroup path fd, sockets)
/// leaks into the target command.
pub(crate) fn close_exec_from(from: RawFd) -> Result<(), Error> {
    for entry in read_dir("/proc/self/fd")? {
        let entry = entry?;
        let fd: RawFd = match entry.file_name().to_str().and_then(|v| v.parse().ok()) {
            Some(fd) => fd,
            None => continue,
        };
        if fd >= from {
            let _ = nix::unistd::close(fd);
        }
    }
    Ok(())
}

/// `true` if `fd` refers to an open file descriptor owned by this process, used by the
/// PTY proxy to tell a closed master from a live one without relying on read() errors alone.
pub(crate) fn fd_is_valid<T: AsRawFd>(fd: &T) -> bool {
    nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD).is_ok()
}
