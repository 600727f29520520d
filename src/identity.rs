use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::process::Command;

use nix::unistd::{setresgid, setresuid, Gid, Pid, Uid};

use crate::Error;

/// Either a single direct mapping (written straight to the proc files) or a contiguous
/// range mapping applied through the setuid `newuidmap`/`newgidmap` helpers. Exactly one
/// variant is active per session.
#[derive(Clone, Debug)]
pub enum IdentityMap {
    Single {
        outside_uid: Uid,
        outside_gid: Gid,
        inside_uid: Uid,
        inside_gid: Gid,
    },
    Range {
        outside_uid_first: Uid,
        uid_len: u32,
        outside_gid_first: Gid,
        gid_len: u32,
    },
}

/// Paths to the setuid helpers consulted for range maps. Overridable for tests.
#[derive(Clone, Debug)]
pub struct IdMapHelpers {
    pub newuidmap: String,
    pub newgidmap: String,
}

impl Default for IdMapHelpers {
    fn default() -> Self {
        Self {
            newuidmap: "/usr/bin/newuidmap".into(),
            newgidmap: "/usr/bin/newgidmap".into(),
        }
    }
}

impl IdentityMap {
    /// Default when neither `--user` nor `--map` is supplied: the invoking user's real
    /// uid/gid mapped to root inside the container, mirroring the teacher's
    /// `ProcUserMapper::default`/`new_root`.
    pub fn default_for_caller(outside_uid: Uid, outside_gid: Gid) -> Self {
        Self::Single {
            outside_uid,
            outside_gid,
            inside_uid: Uid::from_raw(0),
            inside_gid: Gid::from_raw(0),
        }
    }

    /// The uid/gid the child drops to after the map has been installed and the release
    /// barrier has fired.
    pub fn inside_identity(&self) -> (Uid, Gid) {
        match self {
            Self::Single {
                inside_uid,
                inside_gid,
                ..
            } => (*inside_uid, *inside_gid),
            Self::Range { .. } => (Uid::from_raw(0), Gid::from_raw(0)),
        }
    }

    /// Installs the map against `pid` from the parent process, before the release
    /// barrier is released. Both variants are installed by the parent targeting
    /// `/proc/<pid>/*` -- see SPEC_FULL.md section 4.1 for why this crate departs from a
    /// literal self-map reading of the distilled spec.
    pub fn install(&self, pid: Pid, helpers: &IdMapHelpers) -> Result<(), Error> {
        match self {
            Self::Single {
                outside_uid,
                outside_gid,
                inside_uid,
                inside_gid,
            } => {
                deny_setgroups(pid)?;
                write_map(pid, "uid_map", inside_uid.as_raw(), outside_uid.as_raw(), 1)?;
                write_map(pid, "gid_map", inside_gid.as_raw(), outside_gid.as_raw(), 1)?;
                tracing::debug!(target: "warden::identity", %pid, "single identity map installed");
                Ok(())
            }
            Self::Range {
                outside_uid_first,
                uid_len,
                outside_gid_first,
                gid_len,
            } => {
                run_id_map(&helpers.newuidmap, pid, outside_uid_first.as_raw(), *uid_len)
                    .map_err(|e| format!("newuidmap: {e}"))?;
                run_id_map(&helpers.newgidmap, pid, outside_gid_first.as_raw(), *gid_len)
                    .map_err(|e| format!("newgidmap: {e}"))?;
                tracing::debug!(target: "warden::identity", %pid, "range identity map installed");
                Ok(())
            }
        }
    }
}

fn deny_setgroups(pid: Pid) -> Result<(), Error> {
    let path = format!("/proc/{pid}/setgroups");
    match OpenOptions::new().write(true).open(&path) {
        Ok(mut f) => Ok(f.write_all(b"deny\n")?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_map(pid: Pid, file: &str, inside: u32, outside: u32, len: u32) -> Result<(), Error> {
    let path = format!("/proc/{pid}/{file}");
    let mut f = File::options()
        .write(true)
        .open(&path)
        .map_err(|e| format!("open {path}: {e}"))?;
    Ok(f.write_all(format!("{inside} {outside} {len}\n").as_bytes())?)
}

fn run_id_map(binary: &str, pid: Pid, outside_first: u32, len: u32) -> Result<(), Error> {
    let status = Command::new(binary)
        .arg(pid.as_raw().to_string())
        .arg("0")
        .arg(outside_first.to_string())
        .arg(len.to_string())
        .status()?;
    if !status.success() {
        return Err(format!("{binary} exited with {status}").into());
    }
    Ok(())
}

/// Drops the calling (child) process to the configured in-container identity. Must run
/// only after the release barrier has fired and the identity map is already installed.
pub fn drop_identity(uid: Uid, gid: Gid) -> Result<(), Error> {
    setresgid(gid, gid, gid)?;
    Ok(setresuid(uid, uid, uid)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_maps_caller_to_root() {
        let map = IdentityMap::default_for_caller(Uid::from_raw(1000), Gid::from_raw(1000));
        assert_eq!(map.inside_identity(), (Uid::from_raw(0), Gid::from_raw(0)));
    }

    #[test]
    fn single_map_reports_configured_inside_identity() {
        let map = IdentityMap::Single {
            outside_uid: Uid::from_raw(1000),
            outside_gid: Gid::from_raw(1000),
            inside_uid: Uid::from_raw(42),
            inside_gid: Gid::from_raw(43),
        };
        assert_eq!(
            map.inside_identity(),
            (Uid::from_raw(42), Gid::from_raw(43))
        );
    }

    #[test]
    fn range_map_always_drops_to_root() {
        let map = IdentityMap::Range {
            outside_uid_first: Uid::from_raw(100000),
            uid_len: 65536,
            outside_gid_first: Gid::from_raw(100000),
            gid_len: 65536,
        };
        assert_eq!(map.inside_identity(), (Uid::from_raw(0), Gid::from_raw(0)));
    }
}
