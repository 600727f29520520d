//! End-to-end scenarios from the external-interface scenario list. These need real
//! namespace privilege (`CAP_SYS_ADMIN`) and a prepared rootfs, so they are `#[ignore]`
//! by default -- run explicitly with `cargo test -- --ignored` in a capable environment.

use std::process::Command;

mod common;

use common::{get_cgroup, get_rootfs, TempDir};

fn warden() -> Command {
    Command::new(env!("CARGO_BIN_EXE_warden"))
}

fn prepare_rootfs() -> TempDir {
    let dir = TempDir::new().unwrap();
    let mut rootfs = get_rootfs().unwrap();
    rootfs.unpack(dir.as_path()).unwrap();
    dir
}

#[test]
#[ignore]
fn s1_true_exits_zero_and_leaves_no_host_mount() {
    let rootfs = prepare_rootfs();
    let before = std::fs::read_to_string("/proc/self/mountinfo").unwrap();
    let status = warden()
        .args(["-r", rootfs.as_path().to_str().unwrap(), "/bin/true"])
        .status()
        .unwrap();
    assert!(status.success());
    let after = std::fs::read_to_string("/proc/self/mountinfo").unwrap();
    assert_eq!(before, after);
}

#[test]
#[ignore]
fn s2_false_exits_one() {
    let rootfs = prepare_rootfs();
    let status = warden()
        .args(["-r", rootfs.as_path().to_str().unwrap(), "/bin/false"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
#[ignore]
fn s3_extra_tmp_mount_is_visible_inside() {
    let rootfs = prepare_rootfs();
    let scratch = format!("tmp,{}/scratch", rootfs.as_path().display());
    let status = warden()
        .args([
            "-m",
            &scratch,
            "-r",
            rootfs.as_path().to_str().unwrap(),
            "/bin/sh",
            "-c",
            "mountpoint -q /scratch",
        ])
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
#[ignore]
fn s4_range_map_drops_to_root_inside() {
    let rootfs = prepare_rootfs();
    let output = warden()
        .args([
            "-o",
            "0,1,0,1",
            "-r",
            rootfs.as_path().to_str().unwrap(),
            "/bin/id",
            "-u",
        ])
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0");
}

#[test]
#[ignore]
fn s5_no_userns_matches_host_user_namespace() {
    let rootfs = prepare_rootfs();
    let host_link = std::fs::read_link("/proc/self/ns/user").unwrap();
    let output = warden()
        .args([
            "-U",
            "-r",
            rootfs.as_path().to_str().unwrap(),
            "/bin/sh",
            "-c",
            "readlink /proc/self/ns/user",
        ])
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        host_link.to_string_lossy()
    );
}

#[test]
#[ignore]
fn namespace_isolation_matches_bitset() {
    use warden::NamespaceSet;

    let rootfs = prepare_rootfs();
    // `-M` (disable the mount namespace) is rejected whenever `-r` is also given, since the
    // mounts replayed into the new root would otherwise leak onto the host; it is checked
    // separately, without a rootfs, below.
    for (name, bit) in warden::NS_LINKS.iter().filter(|(name, _)| *name != "mnt") {
        let host_link = std::fs::read_link(format!("/proc/self/ns/{name}")).unwrap();
        let mut disabled = NamespaceSet::default();
        match *name {
            "pid" => disabled.pid = false,
            "ipc" => disabled.ipc = false,
            "uts" => disabled.uts = false,
            "user" => disabled.user = false,
            "net" => disabled.net = false,
            _ => unreachable!(),
        }
        let flag = match *name {
            "pid" => "-P",
            "ipc" => "-I",
            "uts" => "-H",
            "user" => "-U",
            "net" => "-N",
            _ => unreachable!(),
        };

        let output = warden()
            .args([
                flag,
                "-r",
                rootfs.as_path().to_str().unwrap(),
                "/bin/sh",
                "-c",
                &format!("readlink /proc/self/ns/{name}"),
            ])
            .output()
            .unwrap();
        let disabled_link = String::from_utf8_lossy(&output.stdout).trim().to_string();
        assert_eq!(
            disabled_link,
            host_link.to_string_lossy(),
            "ns/{name} should match host when disabled"
        );
        assert!(!bit(&disabled));

        let output = warden()
            .args([
                "-r",
                rootfs.as_path().to_str().unwrap(),
                "/bin/sh",
                "-c",
                &format!("readlink /proc/self/ns/{name}"),
            ])
            .output()
            .unwrap();
        let enabled_link = String::from_utf8_lossy(&output.stdout).trim().to_string();
        assert_ne!(
            enabled_link,
            host_link.to_string_lossy(),
            "ns/{name} should differ from host when enabled"
        );
    }
}

#[test]
fn no_mountns_with_chroot_is_rejected_before_any_privileged_work() {
    let status = warden()
        .args(["-M", "-r", "/tmp/does-not-need-to-exist", "/bin/true"])
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
#[ignore]
fn cgroup_placement_joins_and_cleans_up() {
    let rootfs = prepare_rootfs();
    let base = get_cgroup().unwrap();
    let name = format!("test-{}", common::rand_string(16));
    let status = warden()
        .args([
            "-g",
            &name,
            "-r",
            rootfs.as_path().to_str().unwrap(),
            "/bin/true",
        ])
        .status()
        .unwrap();
    assert!(status.success());
    assert!(!base.child(&name).unwrap().as_path().exists());
}

/// `-d` forks away from the invoking shell, so the spawned `Command`'s own pid is not the
/// session's pid; the session is instead discovered via the socket it leaves behind under
/// the runtime directory.
fn wait_for_broker_socket() -> std::path::PathBuf {
    let dir = std::env::var("XDG_RUNTIME_DIR")
        .map(|v| std::path::PathBuf::from(v).join("warden"))
        .unwrap_or_else(|_| std::path::PathBuf::from("/run/warden"));
    for _ in 0..50 {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().extension().and_then(|v| v.to_str()) == Some("sock") {
                    return entry.path();
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    panic!("broker socket never appeared under {}", dir.display());
}

#[test]
#[ignore]
fn s6_detach_then_attach_reaches_same_pty() {
    let rootfs = prepare_rootfs();
    let mut child = warden()
        .args([
            "-d",
            "-r",
            rootfs.as_path().to_str().unwrap(),
            "/bin/sleep",
            "60",
        ])
        .spawn()
        .unwrap();
    let socket = wait_for_broker_socket();
    let pid = socket.file_stem().unwrap().to_str().unwrap().to_string();
    let status = warden().args(["-a", &pid]).status().unwrap();
    assert!(status.success());
    let _ = child.kill();
    let _ = child.wait();
}
