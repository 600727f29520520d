use std::path::PathBuf;

use nix::unistd::{Gid, Uid};

use crate::cgroup::CgroupSpec;
use crate::identity::IdentityMap;
use crate::mounts::MountPlan;
use crate::namespaces::NamespaceSet;
use crate::netif::NetifSpec;
use crate::Pid;

/// Everything the launch orchestrator needs for one session, assembled by CLI parsing in
/// the parent process before any namespace is created. Immutable across the clone.
#[derive(Debug)]
pub struct SessionConfig {
    pub root: Option<PathBuf>,
    pub chdir: Option<PathBuf>,
    pub cgroup: Option<CgroupSpec>,
    pub env: Vec<(String, String)>,
    pub keepenv: bool,
    pub detach: bool,
    pub attach: Option<Pid>,
    pub command: Vec<String>,
    pub namespaces: NamespaceSet,
    pub identity: IdentityMap,
    pub mounts: MountPlan,
    pub netif: NetifSpec,
}

impl SessionConfig {
    /// The command to exec, falling back to an interactive login shell when none is
    /// given on the command line.
    pub fn argv(&self) -> Vec<String> {
        if self.command.is_empty() {
            vec!["/bin/bash".into(), "-bash".into()]
        } else {
            self.command.clone()
        }
    }
}

pub(crate) fn current_identity() -> (Uid, Gid) {
    (nix::unistd::getuid(), nix::unistd::getgid())
}
