use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, dup2, execvpe, fork, setsid, ForkResult};

use crate::cgroup::{do_cgroup, resolve_cgroups, undo_cgroup};
use crate::config::SessionConfig;
use crate::device;
use crate::identity::{drop_identity, IdMapHelpers};
use crate::mounts::{replay_mount_plan, MountPlan};
use crate::netif::{do_netif, setup_loopback, IpBinary};
use crate::pty;
use crate::syscall::{
    clone3, close_exec_from, new_pipe, read_ok, write_ok, CloneArgs, CloneResult, OwnedPid,
};
use crate::Error;

/// Runs one session end to end and returns the process exit code, per section 4.1.
pub fn run(config: SessionConfig) -> Result<i32, Error> {
    if let Some(pid) = config.attach {
        let master = pty::recv(pid)?;
        pty::proxy(master.as_fd())?;
        return Ok(0);
    }

    let (master, slave_name) = pty::open_master()?;
    tracing::info!(target: "warden::session", slave = %slave_name.display(), "allocated pty");

    if config.detach {
        daemonize()?;
    }

    let sync = new_pipe()?;
    let mut clone_args = CloneArgs::default();
    config.namespaces.apply(&mut clone_args);

    let result = unsafe { clone3(&clone_args) }?;
    match result {
        CloneResult::Child => {
            let outcome = run_child(&config, sync, master, &slave_name);
            // `run_child` never returns on success: it execs. Reaching here means failure.
            tracing::error!(target: "warden::session", error = %outcome.unwrap_err(), "child setup failed");
            unsafe { nix::libc::_exit(126) }
        }
        CloneResult::Parent { child } => {
            let child = unsafe { OwnedPid::from_raw(child) };
            run_parent(&config, sync, master, child)
        }
    }
}

/// Detaches the process from its controlling terminal so the rest of the session runs as
/// a background service reachable only through its broker socket (`pty::serve`).
fn daemonize() -> Result<(), Error> {
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => unsafe { nix::libc::_exit(0) },
        ForkResult::Child => {}
    }
    setsid()?;
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    dup2(devnull.as_raw_fd(), 0)?;
    dup2(devnull.as_raw_fd(), 1)?;
    dup2(devnull.as_raw_fd(), 2)?;
    Ok(())
}

fn run_child(
    config: &SessionConfig,
    sync: crate::syscall::Pipe,
    master: std::os::fd::OwnedFd,
    slave_name: &Path,
) -> Result<std::convert::Infallible, Error> {
    let rx = sync.rx();
    read_ok(rx)?;
    drop(master);

    let slave = pty::open_slave(slave_name)?;
    pty::make_stdio(slave)?;
    setsid()?;

    unsafe {
        nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGKILL);
    }

    if let Some(spec) = &config.cgroup {
        do_cgroup(spec, nix::unistd::getpid())?;
    }

    let (uid, gid) = config.identity.inside_identity();
    drop_identity(uid, gid)?;

    if let Some(root) = &config.root {
        let plan = build_mount_plan(config, root)?;
        replay_mount_plan(&plan)?;
        device::materialize(root, slave_name)?;
        chdir(root)?;
        chroot(".")?;
        chdir("/")?;
    }

    if config.namespaces.net {
        setup_loopback(&IpBinary::default())?;
    }

    umask(Mode::from_bits_truncate(0o022));

    if let Some(dir) = &config.chdir {
        chdir(dir.as_path())?;
    }

    let env = sanitize_env(config);

    close_exec_from(3)?;

    let argv = config.argv();
    let filename = CString::new(argv[0].as_bytes())?;
    let argv = Result::<Vec<_>, _>::from_iter(argv.iter().map(|v| CString::new(v.as_bytes())))?;
    let envp = Result::<Vec<_>, _>::from_iter(env.iter().map(|v| CString::new(v.as_bytes())))?;
    Ok(execvpe(&filename, &argv, &envp)?)
}

fn build_mount_plan(config: &SessionConfig, root: &Path) -> Result<MountPlan, Error> {
    let mut plan = MountPlan::with_prologue(root);
    plan.extend(config.mounts.0.iter().cloned());
    Ok(plan)
}

/// Rebuilds the environment per section 6: cleared only when a root is configured and
/// `keepenv` is not set (`PATH` reset, `TERM` preserved across the clear); otherwise the
/// host environment passes through untouched. Either way, `--setenv` entries are applied
/// and `container=warden` is set.
fn sanitize_env(config: &SessionConfig) -> Vec<String> {
    if config.keepenv || config.root.is_none() {
        let mut env: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
        env.extend(config.env.iter().map(|(k, v)| format!("{k}={v}")));
        env.push("container=warden".into());
        return env;
    }
    let mut env = vec!["PATH=/usr/sbin:/usr/bin:/sbin:/bin".to_string()];
    if let Ok(term) = std::env::var("TERM") {
        env.push(format!("TERM={term}"));
    }
    for (k, v) in &config.env {
        env.push(format!("{k}={v}"));
    }
    env.push("container=warden".into());
    env
}

fn run_parent(
    config: &SessionConfig,
    sync: crate::syscall::Pipe,
    master: std::os::fd::OwnedFd,
    child: OwnedPid,
) -> Result<i32, Error> {
    let pid = child.as_raw();

    if config.namespaces.user {
        config
            .identity
            .install(pid, &IdMapHelpers::default())
            .map_err(|e| format!("installing identity map: {e}"))?;
    }
    do_netif(&config.netif, pid, &IpBinary::default())
        .map_err(|e| format!("moving network interfaces: {e}"))?;

    let tx = sync.tx();
    write_ok(tx)?;
    tracing::debug!(target: "warden::session", %pid, "release barrier fired");

    let cgroups = match &config.cgroup {
        Some(spec) => resolve_cgroups(spec).unwrap_or_default(),
        None => Vec::new(),
    };

    if config.detach {
        pty::serve(master.as_fd(), pid)?;
    } else {
        pty::proxy(master.as_fd())?;
    }

    let status = reap(pid);
    undo_cgroup(&cgroups);
    drop(child);

    status
}

/// Sends SIGKILL unconditionally before waiting, so a child that stalled past the end of
/// the PTY session (rather than exiting on its own) cannot hang the reap indefinitely.
fn reap(pid: crate::Pid) -> Result<i32, Error> {
    let _ = kill(pid, Signal::SIGKILL);
    let status = waitid(Id::Pid(pid), WaitPidFlag::WEXITED)?;
    Ok(exit_code_of(&status))
}

fn exit_code_of(status: &WaitStatus) -> i32 {
    match *status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}
