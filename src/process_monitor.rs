//! Process tree controller.
//!
//! Liveness probes, forceful tree termination, descendant enumeration and
//! discovery of a running instance by executable path. The OS-facing part
//! sits behind [`ProcessTree`] so the supervisor can be driven by fakes in
//! tests; [`SystemProcessTree`] is the real implementation (sysinfo + nix on
//! unix, sysinfo + `taskkill` on Windows).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::time::Instant;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("failed to terminate process tree {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    #[error("process tree {pid} not fully terminated, still alive: {survivors:?}")]
    TreeNotFullyTerminated { pid: u32, survivors: Vec<u32> },

    #[error("process query failed: {0}")]
    QueryFailed(String),
}

/// A running process matched by executable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundProcess {
    pub pid: u32,
    /// Full original argv, executable token at index 0.
    pub argv: Vec<String>,
}

impl FoundProcess {
    /// Arguments without the executable token.
    pub fn args(&self) -> Vec<String> {
        self.argv.iter().skip(1).cloned().collect()
    }
}

/// Platform primitives over the OS process table.
///
/// All methods may scan the whole process table and block; async callers
/// go through the `*_async` helpers below, which use `spawn_blocking`.
pub trait ProcessTree: Send + Sync + 'static {
    /// Probe without side effects. Always false for pid 0.
    fn is_alive(&self, pid: u32) -> bool;

    /// Forceful, recursive termination request for `pid` and its
    /// descendants. A process that is already gone is not an error.
    fn kill_tree(&self, pid: u32) -> Result<(), ProcessError>;

    /// `root` plus the transitive closure of its children.
    fn find_descendants(&self, root: u32) -> BTreeSet<u32>;

    /// First process whose normalised executable path matches `path`
    /// (case-insensitive).
    fn find_by_executable_path(&self, path: &str) -> Result<Option<FoundProcess>, ProcessError>;
}

/// Fixed-point closure over a `(parent, child)` edge snapshot.
///
/// Each pass adds every child whose parent is already in the set; stops
/// when a pass adds nothing. At most `edges.len()` passes are needed.
pub fn descendant_closure(root: u32, edges: &[(u32, u32)]) -> BTreeSet<u32> {
    let mut set = BTreeSet::from([root]);
    loop {
        let mut changed = false;
        for &(parent, child) in edges {
            if set.contains(&parent) && set.insert(child) {
                changed = true;
            }
        }
        if !changed {
            return set;
        }
    }
}

/// Bounded poll parameters for [`kill_tree_and_confirm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

// ── Real implementation ─────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTree;

impl SystemProcessTree {
    pub fn new() -> Self {
        Self
    }

    /// Live `(parent, child)` relation; zombies are left out.
    fn edges() -> Vec<(u32, u32)> {
        let mut sys = System::new();
        sys.refresh_processes();
        sys.processes()
            .iter()
            .filter(|(_, p)| p.status() != ProcessStatus::Zombie)
            .filter_map(|(pid, p)| p.parent().map(|parent| (parent.as_u32(), pid.as_u32())))
            .collect()
    }

    /// A zombie has exited and only waits to be reaped; treat it as dead.
    #[cfg(unix)]
    fn is_zombie(pid: u32) -> bool {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        sys.refresh_process(pid)
            && sys
                .process(pid)
                .map(|p| p.status() == ProcessStatus::Zombie)
                .unwrap_or(false)
    }
}

impl ProcessTree for SystemProcessTree {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid as NixPid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw == 0 {
            return false;
        }
        match signal::kill(NixPid::from_raw(raw), None) {
            // EPERM: 존재하지만 시그널 권한이 없음
            Ok(()) | Err(Errno::EPERM) => !Self::is_zombie(pid),
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let mut sys = System::new();
        let spid = Pid::from_u32(pid);
        sys.refresh_process(spid)
            && sys
                .process(spid)
                .map(|p| p.status() != ProcessStatus::Zombie)
                .unwrap_or(false)
    }

    #[cfg(unix)]
    fn kill_tree(&self, pid: u32) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid as NixPid;

        if pid == 0 {
            return Ok(());
        }
        let members = self.find_descendants(pid);
        tracing::info!("Sending KILL to process tree {} ({} processes)", pid, members.len());

        // 루트를 먼저 종료해서 새 자식을 만들지 못하게 함
        let order = std::iter::once(pid).chain(members.iter().copied().filter(|p| *p != pid));
        let mut failures = Vec::new();
        for target in order {
            let Ok(raw) = i32::try_from(target) else {
                continue;
            };
            match signal::kill(NixPid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => failures.push(format!("{}: {}", target, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::KillFailed {
                pid,
                reason: failures.join(", "),
            })
        }
    }

    #[cfg(not(unix))]
    fn kill_tree(&self, pid: u32) -> Result<(), ProcessError> {
        // taskkill exit code 128: no such process
        const NOT_FOUND: i32 = 128;

        if pid == 0 {
            return Ok(());
        }
        tracing::info!("Running taskkill /F /T on process tree {}", pid);
        let mut cmd = std::process::Command::new("taskkill");
        cmd.args(["/F", "/T", "/PID", &pid.to_string()]);
        crate::utils::hide_console_window(&mut cmd);
        let output = cmd.output().map_err(|e| ProcessError::KillFailed {
            pid,
            reason: e.to_string(),
        })?;
        if output.status.success() || output.status.code() == Some(NOT_FOUND) {
            return Ok(());
        }
        Err(ProcessError::KillFailed {
            pid,
            reason: format!(
                "taskkill exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }

    fn find_descendants(&self, root: u32) -> BTreeSet<u32> {
        descendant_closure(root, &Self::edges())
    }

    fn find_by_executable_path(&self, path: &str) -> Result<Option<FoundProcess>, ProcessError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ProcessError::QueryFailed(
                "process enumeration is not supported on this platform".into(),
            ));
        }
        let target = Path::new(path);
        let own_pid = std::process::id();
        let sys = System::new_all();

        // HashMap 순서는 임의적이므로 PID 순으로 정렬해서 결과를 안정화
        let mut candidates: Vec<_> = sys
            .processes()
            .iter()
            .filter(|(pid, p)| pid.as_u32() != own_pid && p.status() != ProcessStatus::Zombie)
            .filter_map(|(pid, p)| p.exe().map(|exe| (pid.as_u32(), exe, p)))
            .collect();
        candidates.sort_by_key(|(pid, _, _)| *pid);

        for (pid, exe, process) in candidates {
            if crate::utils::same_executable(exe, target) {
                let argv = process.cmd().to_vec();
                tracing::info!("Found running instance of '{}': PID {} argv {:?}", path, pid, argv);
                return Ok(Some(FoundProcess { pid, argv }));
            }
        }
        tracing::debug!("No running process matches '{}'", path);
        Ok(None)
    }
}

// ── Async wrappers ─────────────────────────────────────────
// 프로세스 테이블 스캔은 동기 호출이라 tokio 워커 스레드를 막지 않도록
// spawn_blocking 전용 스레드풀에서 실행합니다.

async fn blocking<T, F>(tree: &Arc<dyn ProcessTree>, f: F) -> Result<T, ProcessError>
where
    F: FnOnce(&dyn ProcessTree) -> T + Send + 'static,
    T: Send + 'static,
{
    let tree = tree.clone();
    tokio::task::spawn_blocking(move || f(tree.as_ref()))
        .await
        .map_err(|e| ProcessError::QueryFailed(format!("blocking task failed: {}", e)))
}

pub async fn is_alive_async(tree: &Arc<dyn ProcessTree>, pid: u32) -> bool {
    blocking(tree, move |t| t.is_alive(pid)).await.unwrap_or(false)
}

pub async fn kill_tree_async(tree: &Arc<dyn ProcessTree>, pid: u32) -> Result<(), ProcessError> {
    blocking(tree, move |t| t.kill_tree(pid)).await?
}

pub async fn find_by_executable_path_async(
    tree: &Arc<dyn ProcessTree>,
    path: &str,
) -> Result<Option<FoundProcess>, ProcessError> {
    let path = path.to_string();
    blocking(tree, move |t| t.find_by_executable_path(&path)).await?
}

/// Members of `targets` that are still alive, plus their live descendants.
pub async fn live_members_async(
    tree: &Arc<dyn ProcessTree>,
    targets: &BTreeSet<u32>,
) -> Result<BTreeSet<u32>, ProcessError> {
    let targets = targets.clone();
    blocking(tree, move |t| live_members(t, &targets)).await
}

/// Kill `pid`'s tree, then poll until every member is confirmed dead.
///
/// The member set is captured before the kill: on unix orphans are
/// reparented and would drop out of the root's closure afterwards. Live
/// descendants of survivors are folded in (and killed) on each probe.
/// Fails with [`ProcessError::TreeNotFullyTerminated`] once
/// `policy.timeout` has elapsed with survivors left. On success returns
/// every member that was killed.
pub async fn kill_tree_and_confirm(
    tree: &Arc<dyn ProcessTree>,
    pid: u32,
    policy: KillPolicy,
) -> Result<BTreeSet<u32>, ProcessError> {
    if pid == 0 {
        return Ok(BTreeSet::new());
    }
    let started = Instant::now();
    let mut targets = blocking(tree, move |t| t.find_descendants(pid)).await?;
    kill_tree_async(tree, pid).await?;

    let deadline = started + policy.timeout;
    loop {
        let survivors = live_members_async(tree, &targets).await?;
        if survivors.is_empty() {
            tracing::info!(
                "Process tree {} confirmed terminated after {:?}",
                pid,
                started.elapsed()
            );
            return Ok(targets);
        }

        let newcomers: Vec<u32> = survivors.difference(&targets).copied().collect();
        if !newcomers.is_empty() {
            tracing::warn!("Process tree {} spawned {:?} while being killed", pid, newcomers);
            for p in newcomers {
                if let Err(e) = kill_tree_async(tree, p).await {
                    tracing::warn!("{}", e);
                }
            }
            targets.extend(survivors.iter().copied());
        }

        if Instant::now() >= deadline {
            let survivors: Vec<u32> = survivors.into_iter().collect();
            tracing::error!(
                "Process tree {} still alive after {:?}: {:?}",
                pid,
                policy.timeout,
                survivors
            );
            return Err(ProcessError::TreeNotFullyTerminated { pid, survivors });
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}

fn live_members(tree: &dyn ProcessTree, targets: &BTreeSet<u32>) -> BTreeSet<u32> {
    let mut alive = BTreeSet::new();
    for &p in targets {
        if tree.is_alive(p) {
            alive.extend(tree.find_descendants(p).into_iter().filter(|d| tree.is_alive(*d)));
        }
    }
    alive
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_descendant_closure_follows_grandchildren() {
        let edges = [(1, 2), (2, 3), (4, 5)];
        assert_eq!(descendant_closure(1, &edges), BTreeSet::from([1, 2, 3]));
        assert_eq!(descendant_closure(4, &edges), BTreeSet::from([4, 5]));
        assert_eq!(descendant_closure(3, &edges), BTreeSet::from([3]));
    }

    #[test]
    fn test_descendant_closure_edge_order_independent() {
        // 자식이 부모보다 먼저 나열되어도 고정점까지 반복
        let edges = [(3, 4), (2, 3), (1, 2)];
        assert_eq!(descendant_closure(1, &edges), BTreeSet::from([1, 2, 3, 4]));
    }

    #[test]
    fn test_descendant_closure_survives_cycles() {
        let edges = [(1, 2), (2, 1)];
        assert_eq!(descendant_closure(1, &edges), BTreeSet::from([1, 2]));
    }

    /// In-memory process table. Processes listed in `stubborn` ignore kills;
    /// `dying` maps a pid to the number of probes it survives after a kill.
    #[derive(Default)]
    struct FakeTree {
        alive: Mutex<BTreeSet<u32>>,
        edges: Vec<(u32, u32)>,
        stubborn: BTreeSet<u32>,
        dying: Mutex<HashMap<u32, u32>>,
    }

    impl ProcessTree for FakeTree {
        fn is_alive(&self, pid: u32) -> bool {
            let mut dying = self.dying.lock().unwrap();
            if let Some(left) = dying.get_mut(&pid) {
                if *left == 0 {
                    dying.remove(&pid);
                    self.alive.lock().unwrap().remove(&pid);
                    return false;
                }
                *left -= 1;
                return true;
            }
            self.alive.lock().unwrap().contains(&pid)
        }

        fn kill_tree(&self, pid: u32) -> Result<(), ProcessError> {
            for p in self.find_descendants(pid) {
                if !self.stubborn.contains(&p) && !self.dying.lock().unwrap().contains_key(&p) {
                    self.alive.lock().unwrap().remove(&p);
                }
            }
            Ok(())
        }

        fn find_descendants(&self, root: u32) -> BTreeSet<u32> {
            let alive = self.alive.lock().unwrap().clone();
            let edges: Vec<_> = self
                .edges
                .iter()
                .copied()
                .filter(|(_, c)| alive.contains(c))
                .collect();
            descendant_closure(root, &edges)
        }

        fn find_by_executable_path(&self, _path: &str) -> Result<Option<FoundProcess>, ProcessError> {
            Ok(None)
        }
    }

    fn fast_policy() -> KillPolicy {
        KillPolicy {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn test_confirm_succeeds_when_tree_dies() {
        let fake = FakeTree {
            alive: Mutex::new(BTreeSet::from([1, 2, 3, 9])),
            edges: vec![(1, 2), (2, 3)],
            ..Default::default()
        };
        let tree: Arc<dyn ProcessTree> = Arc::new(fake);
        let members = kill_tree_and_confirm(&tree, 1, fast_policy()).await.unwrap();
        assert_eq!(members, BTreeSet::from([1, 2, 3]));
        assert!(!tree.is_alive(1));
        assert!(!tree.is_alive(3));
        // 다른 트리는 건드리지 않음
        assert!(tree.is_alive(9));
    }

    #[tokio::test]
    async fn test_confirm_waits_for_slow_descendant() {
        let fake = FakeTree {
            alive: Mutex::new(BTreeSet::from([1, 2])),
            edges: vec![(1, 2)],
            dying: Mutex::new(HashMap::from([(2, 3)])),
            ..Default::default()
        };
        let tree: Arc<dyn ProcessTree> = Arc::new(fake);
        let started = std::time::Instant::now();
        kill_tree_and_confirm(&tree, 1, fast_policy()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_confirm_reports_stubborn_tree_after_ceiling() {
        let fake = FakeTree {
            alive: Mutex::new(BTreeSet::from([1, 2])),
            edges: vec![(1, 2)],
            stubborn: BTreeSet::from([2]),
            ..Default::default()
        };
        let tree: Arc<dyn ProcessTree> = Arc::new(fake);
        let policy = fast_policy();
        let started = std::time::Instant::now();
        let err = kill_tree_and_confirm(&tree, 1, policy).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(
            err,
            ProcessError::TreeNotFullyTerminated {
                pid: 1,
                survivors: vec![2]
            }
        );
        assert!(elapsed >= policy.timeout, "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "ceiling not honoured: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_confirm_pid_zero_is_noop() {
        let tree: Arc<dyn ProcessTree> = Arc::new(FakeTree::default());
        assert!(kill_tree_and_confirm(&tree, 0, fast_policy()).await.unwrap().is_empty());
    }

    #[test]
    fn test_system_is_alive() {
        let tree = SystemProcessTree::new();
        assert!(!tree.is_alive(0));
        assert!(tree.is_alive(std::process::id()));
    }

    #[test]
    fn test_found_process_args_skip_executable() {
        let found = FoundProcess {
            pid: 10,
            argv: vec!["/opt/app".into(), "-p".into(), "6666".into()],
        };
        assert_eq!(found.args(), vec!["-p", "6666"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_kill_tree_and_confirm_real_processes() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30 & sleep 30; true"])
            .spawn()
            .unwrap();
        let pid = child.id();
        let tree: Arc<dyn ProcessTree> = Arc::new(SystemProcessTree::new());

        // 셸이 자식 두 개를 만들 때까지 대기
        let mut members = BTreeSet::new();
        for _ in 0..50 {
            members = tree.find_descendants(pid);
            if members.len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(members.len() >= 3, "expected shell + 2 sleeps, got {:?}", members);

        // 부모(테스트 프로세스)가 회수해야 좀비가 사라짐
        let reaper = std::thread::spawn(move || child.wait());
        kill_tree_and_confirm(&tree, pid, KillPolicy::default()).await.unwrap();
        for p in &members {
            assert!(!tree.is_alive(*p), "pid {} survived", p);
        }
        reaper.join().unwrap().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_find_by_executable_path_matches_copy() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("evs-probe-shell");
        std::fs::copy("/bin/sh", &exe).unwrap();
        let exe = std::fs::canonicalize(&exe).unwrap();

        let mut child = std::process::Command::new(&exe)
            .args(["-c", "sleep 30; true"])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let tree = SystemProcessTree::new();
        let upper = exe.to_string_lossy().to_uppercase();
        let found = tree.find_by_executable_path(&upper).unwrap();
        let _ = tree.kill_tree(child.id());
        let _ = child.wait();

        let found = found.expect("copied shell should be discovered");
        assert_eq!(found.pid, child.id());
        assert_eq!(found.args(), vec!["-c", "sleep 30; true"]);
    }
}
