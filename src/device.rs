use std::fs::{remove_file, File};
use std::os::unix::fs::symlink;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::unistd::{chown, Gid, Uid};

use crate::syscall::ignore_kind;
use crate::Error;

const CHAR_DEVICES: &[&str] = &["tty", "null", "zero", "random", "urandom"];

const SYMLINKS: &[(&str, &str)] = &[
    ("core", "/proc/kcore"),
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

/// Populates `<root>/dev` after the mount plan has been replayed: bind-mounted character
/// devices, the fixed symlink set, the `ptmx` pseudo-terminal multiplexer, and the console
/// binding for the slave side of the session's PTY.
pub fn materialize(root: &Path, console_slave: &Path) -> Result<(), Error> {
    let dev = root.join("dev");
    for name in CHAR_DEVICES {
        bind_device_node(&dev, name)?;
    }
    for (name, target) in SYMLINKS {
        make_symlink(&dev, name, target)?;
    }
    make_symlink(&dev, "ptmx", "/dev/pts/ptmx")?;
    bind_console(&dev, console_slave)?;
    Ok(())
}

fn bind_device_node(dev: &Path, name: &str) -> Result<(), Error> {
    let host_node = Path::new("/dev").join(name);
    let target = dev.join(name);
    create_empty_file(&target, Mode::from_bits_truncate(0o600))?;
    Ok(mount(
        Some(&host_node),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| format!("bind device {}: {e}", host_node.display()))?)
}

fn make_symlink(dev: &Path, name: &str, target: &str) -> Result<(), Error> {
    let link = dev.join(name);
    let _ = remove_file(&link);
    Ok(symlink(target, &link).map_err(|e| format!("symlink {}: {e}", link.display()))?)
}

fn bind_console(dev: &Path, slave: &Path) -> Result<(), Error> {
    fchmodat(
        None,
        slave,
        Mode::from_bits_truncate(0o600),
        FchmodatFlags::FollowSymlink,
    )?;
    chown(slave, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))?;
    let target = dev.join("console");
    create_empty_file(&target, Mode::from_bits_truncate(0o600))?;
    Ok(mount(
        Some(slave),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| format!("bind console: {e}"))?)
}

fn create_empty_file(path: &Path, mode: Mode) -> Result<(), Error> {
    ignore_kind(
        File::options()
            .write(true)
            .create(true)
            .mode(mode.bits() as u32)
            .open(path)
            .map(|_| ()),
        std::io::ErrorKind::AlreadyExists,
    )?;
    Ok(())
}
