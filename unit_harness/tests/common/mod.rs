#![allow(dead_code)]

use std::{
    path::PathBuf,
    process::{Child, Command, Stdio},
};

use unit_harness::*;

/// Build directory of a real Unit build, when the environment names one.
pub fn real_builddir() -> Option<PathBuf> {
    let dir = PathBuf::from(std::env::var_os(BUILDDIR_ENV)?);
    if UnitPaths::new(&dir).unitd.is_file() {
        Some(dir)
    } else {
        eprintln!("{BUILDDIR_ENV} set but holds no sbin/unitd; skipping");
        None
    }
}

/// A shell that forks `n` sleepers tagged with `tag` and then waits on them.
pub fn spawn_parent(tag: &str, n: usize) -> std::io::Result<Child> {
    let children = (0..n)
        .map(|_| format!("sh -c \"sleep 30; : '{tag}'\" &"))
        .collect::<Vec<_>>()
        .join(" ");
    Command::new("sh")
        .arg("-c")
        .arg(format!("{children} wait"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

/// Terminates `child`'s direct children and then kills `child` itself.
pub fn reap(census: &ProcessCensus, mut child: Child) {
    let root = child.id();
    let pids: Vec<u32> = census
        .rooted_at(root)
        .into_iter()
        .map(|e| e.pid)
        .filter(|&p| p != root)
        .collect();
    for pid in pids {
        let _ = unit_harness::process::terminate_pid(pid);
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Polls `probe` until it holds or `budget` runs out.
pub fn eventually(budget: std::time::Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + budget;
    loop {
        if probe() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}
