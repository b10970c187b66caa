//! Stand-ins for a real build: a shell script that behaves like `unitd` on
//! the process level, and a control socket stub that answers the few
//! requests the harness itself sends.

use std::{
    io::{Read, Write},
    os::unix::{fs::PermissionsExt, net::UnixListener},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use super::CONTROL_SOCKET;

fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A foreground loop with `on_quit` as its SIGQUIT trap.
pub fn fake_unitd(dir: &Path, on_quit: &str) -> PathBuf {
    let path = dir.join("unitd");
    write_script(
        &path,
        &format!(
            "#!/bin/sh\necho \"started $*\" >&2\ntrap '{on_quit}' QUIT\nwhile :; do sleep 0.05; done\n"
        ),
    );
    path
}

/// A build directory whose `sbin/unitd` mimics the server's process tree:
/// it writes the pid file, logs a module and `controller started`, and
/// forks a router and a controller child. SIGQUIT takes the whole group
/// down and exits 0.
///
/// The build directory itself is named `unit: main` so the main process's
/// command line carries the main title, as the real server's does.
pub fn fake_build(base: &Path) -> PathBuf {
    let builddir = base.join("unit: main");
    write_script(
        &builddir.join("sbin").join("unitd"),
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "unit version: 1.34.0" >&2
    echo "configure arguments: --openssl" >&2
    exit 0
fi
while [ $# -gt 0 ]; do
    case "$1" in
        --pid) pidfile="$2"; shift ;;
    esac
    shift
done
sh -c "sleep 300; : 'unit: router'" &
sh -c "sleep 300; : 'unit: controller'" &
c=$!
echo $$ > "$pidfile"
echo '2026/01/01 00:00:00 [info] 1#1 module: python 3.12.1 "/build/lib/unit/modules/python.unit.so"' >&2
echo '2026/01/01 00:00:00 [info] 1#1 controller started' >&2
trap 'trap "" TERM; kill 0; exit 0' QUIT
wait $c
"#,
    );
    builddir
}

/// Serves the control socket of every instance directory that appears under
/// `tmp_root`. `PUT /config` succeeds, the certificate store is empty, every
/// other path answers 404.
#[derive(Debug)]
pub struct ControlStub {
    pub requests: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
}

impl ControlStub {
    pub fn watch(tmp_root: &Path) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let root = tmp_root.to_path_buf();
        {
            let requests = requests.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut served = Vec::<PathBuf>::new();
                while !stop.load(Ordering::SeqCst) {
                    for entry in std::fs::read_dir(&root).into_iter().flatten().flatten() {
                        let dir = entry.path();
                        if !dir.is_dir() || served.contains(&dir) {
                            continue;
                        }
                        served.push(dir.clone());
                        if let Ok(listener) = UnixListener::bind(dir.join(CONTROL_SOCKET)) {
                            let requests = requests.clone();
                            std::thread::spawn(move || serve(listener, requests));
                        }
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            });
        }
        Self { requests, stop }
    }

    pub fn seen(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }
}

impl Drop for ControlStub {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn serve(listener: UnixListener, requests: Arc<Mutex<Vec<String>>>) {
    for stream in listener.incoming() {
        let Ok(mut stream) = stream else { return };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            if request_complete(&buf) {
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.lines().next().unwrap_or_default().to_owned();
        let (status, body) = if line.starts_with("PUT /config ") {
            ("200 OK", r#"{"success": "Reconfiguration done."}"#)
        } else if line.starts_with("GET /certificates ") {
            ("200 OK", "{}")
        } else {
            ("404 Not Found", r#"{"error": "Value doesn't exist."}"#)
        };
        requests.lock().unwrap().push(line);
        let _ = write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
    }
}

fn request_complete(buf: &[u8]) -> bool {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
    let length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    buf.len() >= end + 4 + length
}
