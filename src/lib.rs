mod cgroup;
mod cli;
mod config;
mod device;
mod identity;
mod mounts;
mod namespaces;
mod netif;
mod pty;
mod session;
mod syscall;

pub use cgroup::*;
pub use cli::Cli;
pub use config::*;
pub use device::*;
pub use identity::*;
pub use mounts::*;
pub use namespaces::*;
pub use netif::*;
pub use pty::*;
pub use session::*;
pub use syscall::Pid;

/// The crate-wide error type: a boxed, thread-safe `std::error::Error`.
///
/// Every fallible function in this crate returns `Result<T, Error>`; context is attached
/// at module boundaries with `.map_err(|e| format!("...: {e}").into())` rather than by
/// introducing a structured error enum.
pub type Error = Box<dyn std::error::Error + Send + Sync>;
