use std::path::PathBuf;

use clap::Parser;
use nix::unistd::{Gid, Pid, Uid};

use crate::cgroup::CgroupSpec;
use crate::config::{current_identity, SessionConfig};
use crate::identity::IdentityMap;
use crate::mounts::{parse_mount_spec, MountPlan};
use crate::namespaces::NamespaceSet;
use crate::netif::NetifSpec;
use crate::Error;

/// Launches a command inside a fresh set of Linux namespaces.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Bind, overlay, or tmpfs entries to add to the mount plan (repeatable).
    #[arg(short = 'm', long = "mount", value_name = "SPEC")]
    mount: Vec<String>,

    /// Enable the network namespace; optionally move a host interface into it (repeatable).
    #[arg(short = 'n', long = "netif", value_name = "IFACE")]
    netif: Vec<String>,

    /// Single in-container identity: "uid,gid".
    #[arg(short = 'u', long = "user", value_name = "UID,GID")]
    user: Option<String>,

    /// Range identity map via newuidmap/newgidmap: "outside_uid,len,outside_gid,len".
    #[arg(short = 'o', long = "map", value_name = "U,ULEN,G,GLEN")]
    map: Option<String>,

    /// Root directory for the new mount namespace.
    #[arg(short = 'r', long = "chroot", value_name = "PATH")]
    chroot: Option<PathBuf>,

    /// Directory to chdir into once inside the container.
    #[arg(short = 'c', long = "chdir", value_name = "PATH")]
    chdir: Option<PathBuf>,

    /// Comma-separated cgroup sub-hierarchy names to join.
    #[arg(short = 'g', long = "cgroup", value_name = "SPEC")]
    cgroup: Option<String>,

    /// Daemonize and serve the controlling PTY over a Unix socket instead of proxying it.
    #[arg(short = 'd', long = "detach")]
    detach: bool,

    /// Reattach to a detached session's controlling PTY.
    #[arg(short = 'a', long = "attach", value_name = "PID")]
    attach: Option<i32>,

    /// Extra environment assignments "K=V" (comma-separated, repeatable).
    #[arg(short = 's', long = "setenv", value_name = "K=V[,K=V...]")]
    setenv: Vec<String>,

    /// Do not clear the environment before exec.
    #[arg(short = 'k', long = "keepenv")]
    keepenv: bool,

    /// Disable the user namespace.
    #[arg(short = 'U', long = "no-userns")]
    no_userns: bool,

    /// Disable the mount namespace.
    #[arg(short = 'M', long = "no-mountns")]
    no_mountns: bool,

    /// Disable the network namespace.
    #[arg(short = 'N', long = "no-netns")]
    no_netns: bool,

    /// Disable the IPC namespace.
    #[arg(short = 'I', long = "no-ipcns")]
    no_ipcns: bool,

    /// Disable the UTS namespace.
    #[arg(short = 'H', long = "no-utsns")]
    no_utsns: bool,

    /// Disable the PID namespace.
    #[arg(short = 'P', long = "no-pidns")]
    no_pidns: bool,

    /// Raise log verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command and arguments to run inside the container. Defaults to an interactive shell.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    /// Builds the in-memory session plan from parsed flags. Path resolution for mount
    /// specs happens here, in the parent, before any namespace is touched.
    pub fn into_config(self) -> Result<SessionConfig, Error> {
        if self.user.is_some() && self.map.is_some() {
            return Err("--user and --map are mutually exclusive".into());
        }

        let attach = self.attach.map(Pid::from_raw);

        let namespaces = NamespaceSet {
            mount: !self.no_mountns,
            pid: !self.no_pidns,
            ipc: !self.no_ipcns,
            uts: !self.no_utsns,
            user: !self.no_userns,
            net: !self.no_netns || !self.netif.is_empty(),
        };

        if self.chroot.is_some() && !namespaces.mount {
            return Err("--no-mountns cannot be combined with --chroot: the mounts \
                        replayed into the new root would otherwise leak onto the host"
                .into());
        }

        let identity = if let Some(spec) = &self.user {
            parse_single_map(spec)?
        } else if let Some(spec) = &self.map {
            parse_range_map(spec)?
        } else {
            let (uid, gid) = current_identity();
            IdentityMap::default_for_caller(uid, gid)
        };

        let mut mounts = MountPlan::new();
        for spec in &self.mount {
            mounts.extend(parse_mount_spec(spec)?);
        }

        let mut netif = NetifSpec::default();
        for iface in &self.netif {
            netif.add(iface.clone());
        }

        let mut env = Vec::new();
        for group in &self.setenv {
            for assignment in group.split(',') {
                let (k, v) = assignment
                    .split_once('=')
                    .ok_or_else(|| format!("invalid --setenv assignment: {assignment}"))?;
                env.push((k.to_owned(), v.to_owned()));
            }
        }

        Ok(SessionConfig {
            root: self.chroot,
            chdir: self.chdir,
            cgroup: self.cgroup.as_deref().map(CgroupSpec::parse),
            env,
            keepenv: self.keepenv,
            detach: self.detach,
            attach,
            command: self.command,
            namespaces,
            identity,
            mounts,
            netif,
        })
    }
}

fn parse_single_map(spec: &str) -> Result<IdentityMap, Error> {
    let fields: Vec<&str> = spec.split(',').collect();
    match fields.as_slice() {
        [uid, gid] => {
            let (outside_uid, outside_gid) = current_identity();
            Ok(IdentityMap::Single {
                outside_uid,
                outside_gid,
                inside_uid: Uid::from_raw(uid.parse()?),
                inside_gid: Gid::from_raw(gid.parse()?),
            })
        }
        _ => Err(format!("invalid --user spec: {spec}").into()),
    }
}

fn parse_range_map(spec: &str) -> Result<IdentityMap, Error> {
    let fields: Vec<&str> = spec.split(',').collect();
    match fields.as_slice() {
        [u, ulen, g, glen] => Ok(IdentityMap::Range {
            outside_uid_first: Uid::from_raw(u.parse()?),
            uid_len: ulen.parse()?,
            outside_gid_first: Gid::from_raw(g.parse()?),
            gid_len: glen.parse()?,
        }),
        _ => Err(format!("invalid --map spec: {spec}").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_user_and_map_together() {
        let cli = Cli::parse_from([
            "warden", "-u", "1000,1000", "-o", "0,1,0,1", "/bin/true",
        ]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn single_map_parses_two_fields() {
        let map = parse_single_map("1000,1000").unwrap();
        assert!(matches!(map, IdentityMap::Single { .. }));
    }

    #[test]
    fn range_map_requires_four_fields() {
        assert!(parse_range_map("0,1,0").is_err());
    }

    #[test]
    fn netif_implies_net_namespace_even_with_no_netns() {
        let cli = Cli::parse_from(["warden", "-N", "-n", "eth0", "/bin/true"]);
        let config = cli.into_config().unwrap();
        assert!(config.namespaces.net);
    }
}
