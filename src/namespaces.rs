use crate::syscall::CloneArgs;

/// Bitset over the six namespace kinds this launcher deals in. Default is "all six";
/// the CLI's `--no-*ns` flags clear individual bits before the clone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamespaceSet {
    pub mount: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub user: bool,
    pub net: bool,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self {
            mount: true,
            pid: true,
            ipc: true,
            uts: true,
            user: true,
            net: true,
        }
    }
}

impl NamespaceSet {
    pub(crate) fn apply(&self, args: &mut CloneArgs) {
        args.flag_exit_sigchld();
        if self.mount {
            args.flag_newns();
        }
        if self.pid {
            args.flag_newpid();
        }
        if self.ipc {
            args.flag_newipc();
        }
        if self.uts {
            args.flag_newuts();
        }
        if self.user {
            args.flag_newuser();
        }
        if self.net {
            args.flag_newnet();
        }
    }
}

/// `/proc/self/ns/<name>` link names paired with the bit each one corresponds to, in the
/// same order the CLI's `--no-*ns` flags name them. Used by integration tests to check
/// namespace isolation generically across all six kinds, not just the user namespace.
pub const NS_LINKS: &[(&str, fn(&NamespaceSet) -> bool)] = &[
    ("mnt", |s| s.mount),
    ("pid", |s| s.pid),
    ("ipc", |s| s.ipc),
    ("uts", |s| s.uts),
    ("user", |s| s.user),
    ("net", |s| s.net),
];
