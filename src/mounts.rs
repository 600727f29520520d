use std::fs::create_dir_all;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};

use crate::syscall::ignore_kind;
use crate::Error;

/// One entry in the mount plan: a source (absent for tmpfs/proc), a destination, an
/// optional filesystem type (absent means "plain bind"), mount flags, and an optional
/// option string handed to the kernel as mount data.
#[derive(Clone, Debug)]
pub struct MountEntry {
    pub source: Option<PathBuf>,
    pub destination: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub options: Option<String>,
}

impl MountEntry {
    fn bind(source: PathBuf, destination: PathBuf, extra: MsFlags) -> Self {
        Self {
            source: Some(source),
            destination,
            fstype: None,
            flags: MsFlags::MS_BIND | extra,
            options: None,
        }
    }
}

/// The ordered sequence of mounts to replay inside the child's mount namespace. Built as
/// a plain `Vec`, pushed to in the order the CLI parser and prologue construction
/// encounter entries -- no reversal, no linked list.
#[derive(Clone, Debug, Default)]
pub struct MountPlan(pub Vec<MountEntry>);

impl MountPlan {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, entry: MountEntry) {
        self.0.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = MountEntry>) {
        self.0.extend(entries);
    }

    /// Prologue prepended when a root directory is configured: proc, sys, dev, dev/shm, run.
    pub fn with_prologue(root: &Path) -> Self {
        let mut plan = Self::new();
        plan.push(MountEntry {
            source: None,
            destination: root.join("proc"),
            fstype: Some("proc".into()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            options: None,
        });
        plan.push(MountEntry::bind(
            PathBuf::from("/sys"),
            root.join("sys"),
            MsFlags::MS_REC,
        ));
        plan.push(MountEntry::bind(
            PathBuf::from("/dev"),
            root.join("dev"),
            MsFlags::MS_REC,
        ));
        plan.push(MountEntry {
            source: None,
            destination: root.join("dev/shm"),
            fstype: Some("tmpfs".into()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_STRICTATIME,
            options: Some("mode=1777".into()),
        });
        plan.push(MountEntry {
            source: None,
            destination: root.join("run"),
            fstype: Some("tmpfs".into()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_STRICTATIME,
            options: Some("mode=755".into()),
        });
        plan
    }
}

/// Parses one `--mount` spec (comma-separated grammar from section 4.3) into one or two
/// plan entries (`bind-ro` expands into a bind followed by a read-only remount). Paths are
/// canonicalized against the host filesystem here, before the namespace is unshared --
/// resolution failure is a configuration error, not deferred to mount() time.
pub fn parse_mount_spec(spec: &str) -> Result<Vec<MountEntry>, Error> {
    let fields: Vec<&str> = spec.split(',').collect();
    match fields.as_slice() {
        ["bind", src, dst] => Ok(vec![MountEntry::bind(
            resolve(src)?,
            PathBuf::from(dst),
            MsFlags::empty(),
        )]),
        ["bind-ro", src, dst] => {
            let dst = PathBuf::from(dst);
            Ok(vec![
                MountEntry::bind(resolve(src)?, dst.clone(), MsFlags::empty()),
                MountEntry {
                    source: None,
                    destination: dst,
                    fstype: None,
                    flags: MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                    options: None,
                },
            ])
        }
        ["aufs", overlay, dst] => {
            let overlay = resolve(overlay)?;
            let dst_resolved = resolve(dst)?;
            Ok(vec![MountEntry {
                source: Some(PathBuf::from("aufs")),
                destination: PathBuf::from(dst),
                fstype: Some("aufs".into()),
                flags: MsFlags::empty(),
                options: Some(format!(
                    "br:{}=rw:{}=ro",
                    overlay.display(),
                    dst_resolved.display()
                )),
            }])
        }
        ["overlay", overlay, dst, work] => {
            let overlay = resolve(overlay)?;
            let dst_resolved = resolve(dst)?;
            let work = resolve(work)?;
            if overlay_supported() {
                Ok(vec![MountEntry {
                    source: Some(PathBuf::from("overlay")),
                    destination: PathBuf::from(dst),
                    fstype: Some("overlay".into()),
                    flags: MsFlags::empty(),
                    options: Some(format!(
                        "upperdir={},lowerdir={},workdir={}",
                        overlay.display(),
                        dst_resolved.display(),
                        work.display()
                    )),
                }])
            } else {
                Ok(vec![MountEntry {
                    source: Some(PathBuf::from("aufs")),
                    destination: PathBuf::from(dst),
                    fstype: Some("aufs".into()),
                    flags: MsFlags::empty(),
                    options: Some(format!(
                        "br:{}=rw:{}=ro",
                        overlay.display(),
                        dst_resolved.display()
                    )),
                }])
            }
        }
        ["tmp", dst] => Ok(vec![MountEntry {
            source: Some(PathBuf::from("tmpfs")),
            destination: PathBuf::from(dst),
            fstype: Some("tmpfs".into()),
            flags: MsFlags::empty(),
            options: None,
        }]),
        _ => Err(format!("invalid mount spec: {spec}").into()),
    }
}

fn resolve(path: &str) -> Result<PathBuf, Error> {
    std::fs::canonicalize(path)
        .map_err(|e| format!("cannot resolve mount path {path}: {e}").into())
}

fn overlay_supported() -> bool {
    std::fs::read_to_string("/proc/filesystems")
        .map(|v| v.lines().any(|line| line.trim_end() == "overlay" || line.trim_end().ends_with("\toverlay")))
        .unwrap_or(false)
}

/// Prevents mount events from propagating to the host's mount table (testable property 4:
/// no host mount leak). Must run before any entry in the plan is replayed.
pub(crate) fn isolate_mount_propagation() -> Result<(), Error> {
    Ok(mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?)
}

/// Replays the plan in insertion order: `mkdir` the destination (ignoring `EEXIST`), then
/// `mount`. Any mount failure is fatal; no mounts are rolled back on error, since they
/// vanish with the mount namespace when the child process exits.
pub fn replay_mount_plan(plan: &MountPlan) -> Result<(), Error> {
    isolate_mount_propagation()?;
    for entry in &plan.0 {
        ignore_kind(
            create_dir_all(&entry.destination).map(|_| ()),
            ErrorKind::AlreadyExists,
        )?;
        mount(
            entry.source.as_deref(),
            &entry.destination,
            entry.fstype.as_deref(),
            entry.flags,
            entry.options.as_deref(),
        )
        .map_err(|e| format!("mount {:?} -> {:?}: {e}", entry.source, entry.destination))?;
        tracing::debug!(target: "warden::mounts", dst = %entry.destination.display(), "mounted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tmp_spec() {
        let entries = parse_mount_spec("tmp,/scratch").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fstype.as_deref(), Some("tmpfs"));
        assert_eq!(entries[0].destination, PathBuf::from("/scratch"));
    }

    #[test]
    fn parses_bind_ro_as_two_entries() {
        let entries = parse_mount_spec("bind-ro,/,/ro").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].flags.contains(MsFlags::MS_RDONLY));
        assert!(entries[1].flags.contains(MsFlags::MS_REMOUNT));
    }

    #[test]
    fn rejects_unknown_mount_type() {
        assert!(parse_mount_spec("bogus,/a,/b").is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse_mount_spec("bind,/a").is_err());
    }

    #[test]
    fn prologue_has_five_entries_in_order() {
        let plan = MountPlan::with_prologue(Path::new("/rootfs"));
        assert_eq!(plan.0.len(), 5);
        assert_eq!(plan.0[0].destination, PathBuf::from("/rootfs/proc"));
        assert_eq!(plan.0[4].destination, PathBuf::from("/rootfs/run"));
    }
}
