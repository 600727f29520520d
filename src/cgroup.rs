use std::fs::{create_dir_all, read, remove_dir, File};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::{Error, Pid};

#[derive(Clone, Debug)]
pub struct Cgroup {
    mount_path: PathBuf,
    path: PathBuf,
}

const PROC_CGROUP: &str = "/proc/self/cgroup";
const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CGROUP_PROCS: &str = "cgroup.procs";

impl Cgroup {
    pub fn new(mount_path: impl Into<PathBuf>, name: impl AsRef<Path>) -> Result<Self, Error> {
        let name = name.as_ref();
        if name.is_absolute() {
            Err("Cgroup name cannot be absolute")?
        }
        let mount_path = mount_path.into();
        if !mount_path.is_absolute() {
            Err("Cgroup mount path should be absolute")?
        }
        let path = mount_path.join(name);
        Ok(Self { mount_path, path })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &Path {
        self.path
            .strip_prefix(&self.mount_path)
            .expect("Cgroup path does not starts with mount path")
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn current() -> Result<Self, Error> {
        for line in String::from_utf8(read(PROC_CGROUP)?)?.split('\n') {
            let parts: Vec<_> = line.split(':').collect();
            if let Some(v) = parts.get(1) {
                if !v.is_empty() {
                    continue;
                }
            }
            let cgroup = parts
                .get(2)
                .ok_or("Expected cgroup path")?
                .trim_start_matches('/');
            return Cgroup::new(CGROUP_MOUNT, cgroup);
        }
        Err("Cannot resolve cgroup".into())
    }

    pub fn parent(&self) -> Option<Self> {
        let path = self.path.parent()?;
        if path.starts_with(&self.mount_path) {
            let mount_path = self.mount_path.clone();
            let path = path.to_owned();
            Some(Self { mount_path, path })
        } else {
            None
        }
    }

    pub fn child(&self, name: impl AsRef<Path>) -> Result<Self, Error> {
        let name = name.as_ref();
        if name.is_absolute() {
            Err("Child cgroup name cannot be absolute")?
        }
        let mount_path = self.mount_path.clone();
        let path = self.path.join(name);
        Ok(Self { mount_path, path })
    }

    pub fn create(&self) -> Result<(), Error> {
        Ok(create_dir_all(&self.path)?)
    }

    pub fn remove(&self) -> Result<(), Error> {
        Ok(remove_dir(&self.path)?)
    }

    pub fn add_process(&self, pid: Pid) -> Result<(), Error> {
        Ok(File::options()
            .create(false)
            .write(true)
            .truncate(false)
            .open(self.path.join(CGROUP_PROCS))?
            .write_all(pid.to_string().as_bytes())?)
    }

    pub fn open(&self) -> Result<File, Error> {
        Ok(File::options()
            .read(true)
            .custom_flags(nix::libc::O_PATH | nix::libc::O_DIRECTORY)
            .open(&self.path)?)
    }
}

/// A `--cgroup` spec: one sub-path per comma-separated entry, each resolved as a child of
/// the invoking process's own cgroup (section 4.6's "named sub-hierarchy").
#[derive(Clone, Debug, Default)]
pub struct CgroupSpec(pub Vec<String>);

impl CgroupSpec {
    pub fn parse(spec: &str) -> Self {
        Self(spec.split(',').map(|v| v.to_owned()).collect())
    }
}

/// Joins (creating if necessary) every sub-hierarchy named in `spec` and writes `pid` into
/// each one's `cgroup.procs`. Returns the created groups so `undo_cgroup` can remove them.
/// Called from the child with its own PID, before it drops to the in-container identity.
pub fn do_cgroup(spec: &CgroupSpec, pid: Pid) -> Result<Vec<Cgroup>, Error> {
    let current = Cgroup::current()?;
    let mut joined = Vec::with_capacity(spec.0.len());
    for name in &spec.0 {
        let cgroup = current.child(name)?;
        cgroup.create()?;
        cgroup.add_process(pid)?;
        tracing::debug!(target: "warden::cgroup", cgroup = %cgroup.as_path().display(), %pid, "joined");
        joined.push(cgroup);
    }
    Ok(joined)
}

/// Resolves the same sub-hierarchies `do_cgroup` would join, without creating or writing
/// anything. Used by the parent, which shares the child's cgroup view (no cgroup
/// namespace is unshared), to find the groups to remove once the child has exited.
pub fn resolve_cgroups(spec: &CgroupSpec) -> Result<Vec<Cgroup>, Error> {
    let current = Cgroup::current()?;
    spec.0.iter().map(|name| current.child(name)).collect()
}

/// Best-effort removal of groups created by `do_cgroup`; a non-empty group (processes
/// still attached, or the child never actually started) is left in place.
pub fn undo_cgroup(groups: &[Cgroup]) {
    for cgroup in groups {
        if let Err(e) = cgroup.remove() {
            tracing::warn!(target: "warden::cgroup", cgroup = %cgroup.as_path().display(), error = %e, "cgroup removal skipped");
        }
    }
}
