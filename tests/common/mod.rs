//! Shared harness: a registry of `/bin/sh` script apps, a supervisor on
//! the real process table, and a control server on an ephemeral port.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use evs_core::config::ConfigStore;
use evs_core::ipc::IPCServer;
use evs_core::process_monitor::{KillPolicy, ProcessTree, SystemProcessTree};
use evs_core::supervisor::{Supervisor, SupervisorOptions};

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub sup: Arc<Supervisor>,
    pub addr: SocketAddr,
}

impl Harness {
    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    pub async fn send(&self, line: &str) -> String {
        send(self.addr, line).await
    }

    /// Contents of a file the script apps write, once it is complete.
    pub async fn wait_file(&self, name: &str) -> String {
        let path = self.dir.path().join(name);
        for _ in 0..500 {
            if let Ok(text) = std::fs::read_to_string(&path) {
                if text.ends_with('\n') {
                    return text.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never written", path.display());
    }
}

pub fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        kill_policy: KillPolicy {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
        },
        restart_confirm_retries: 50,
        adopt_poll_interval: Duration::from_millis(50),
        idle_exit_grace: None,
        clear_discovered_args_on_switch: false,
    }
}

/// An app that records its args and its background child's PID, then
/// waits on that child (a two-level process tree).
pub fn write_app(dir: &Path, name: &str) -> PathBuf {
    let script = dir.join(format!("{}.sh", name));
    let body = format!(
        "#!/bin/sh\n\
         echo $$ >> '{dir}/pids'\n\
         echo \"$@\" > '{dir}/{name}.args'\n\
         sleep 30 &\n\
         echo $! > '{dir}/{name}.child'\n\
         wait\n",
        dir = dir.display(),
        name = name
    );
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

pub fn registry_toml(active: &str, apps: &[(&str, &Path, &[&str])]) -> String {
    let mut text = format!("activate = \"{}\"\n", active);
    for (name, path, args) in apps {
        let args: Vec<String> = args.iter().map(|a| format!("\"{}\"", a)).collect();
        text.push_str(&format!(
            "\n[apps.{}]\npath = '{}'\nargs = [{}]\n",
            name,
            path.display(),
            args.join(", ")
        ));
    }
    text
}

/// `config` is written as `config.toml` unless `None` (no registry file).
pub async fn start(
    dir: tempfile::TempDir,
    config: Option<String>,
    options: SupervisorOptions,
    read_timeout: Duration,
) -> Harness {
    let path = dir.path().join("config.toml");
    if let Some(body) = config {
        std::fs::write(&path, body).unwrap();
    }
    let store = ConfigStore::new(&path);
    let _ = store.force_reload();

    // 스크립트 작성 직후 exec 하면 ETXTBSY 가 날 수 있음
    tokio::time::sleep(Duration::from_millis(50)).await;

    let tree: Arc<dyn ProcessTree> = Arc::new(SystemProcessTree::new());
    let sup = Supervisor::new(Arc::new(store), tree, options, Vec::new());
    let server = IPCServer::new(sup.clone(), "127.0.0.1:0", read_timeout);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    Harness { dir, sup, addr }
}

pub async fn send(addr: SocketAddr, line: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(30), stream.read_to_string(&mut reply))
        .await
        .expect("reply in time")
        .unwrap();
    reply.trim_end_matches('\n').to_string()
}

pub fn alive(pid: u32) -> bool {
    SystemProcessTree::new().is_alive(pid)
}

pub async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
