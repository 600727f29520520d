use std::process::Command;

use crate::Pid;
use crate::Error;

/// A `--netif` spec: the host interface names to move into the child's network namespace,
/// accumulated across repeated occurrences of the flag.
#[derive(Clone, Debug, Default)]
pub struct NetifSpec(pub Vec<String>);

impl NetifSpec {
    pub fn add(&mut self, name: impl Into<String>) {
        self.0.push(name.into());
    }
}

/// Path to the `ip` binary used for interface moves, overridable for tests. Grounded in
/// the teacher's own preference for shelling out to a well-known external binary for
/// anything network-namespace-shaped (`network.rs`'s `Slirp4NetnsManager`).
#[derive(Clone, Debug)]
pub struct IpBinary(pub String);

impl Default for IpBinary {
    fn default() -> Self {
        Self("/sbin/ip".into())
    }
}

/// Moves every named interface into the child's network namespace. Runs in the parent,
/// before the release barrier, per 4.1 step 7.
pub fn do_netif(spec: &NetifSpec, pid: Pid, ip: &IpBinary) -> Result<(), Error> {
    for name in &spec.0 {
        let status = Command::new(&ip.0)
            .args(["link", "set", name, "netns"])
            .arg(pid.as_raw().to_string())
            .status()
            .map_err(|e| format!("{}: {e}", ip.0))?;
        if !status.success() {
            return Err(format!("ip link set {name} netns {pid} failed: {status}").into());
        }
        tracing::debug!(target: "warden::netif", iface = %name, %pid, "moved");
    }
    Ok(())
}

/// Brings `lo` up inside the child's (now entered) network namespace. Runs after the
/// release barrier, before exec.
pub fn setup_loopback(ip: &IpBinary) -> Result<(), Error> {
    let status = Command::new(&ip.0)
        .args(["link", "set", "lo", "up"])
        .status()
        .map_err(|e| format!("{}: {e}", ip.0))?;
    if !status.success() {
        return Err(format!("ip link set lo up failed: {status}").into());
    }
    Ok(())
}
