pub mod args;
pub mod error;
pub mod idle;
pub mod launcher;
pub mod state_machine;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{AppSpec, ConfigError, ConfigStore, Registry, ServiceSettings};
use crate::process_monitor::{
    find_by_executable_path_async, is_alive_async, kill_tree_and_confirm, kill_tree_async,
    live_members_async, KillPolicy, ProcessTree,
};

use args::merge_args;
pub use error::SupervisorError;
use idle::IdleTimer;
use launcher::{LaunchEvent, Launcher, Transition};
use state_machine::SupervisorState;

/// Tunables, normally derived from the `[service]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub kill_policy: KillPolicy,
    /// post-stop liveness re-checks before `restart` launches again
    pub restart_confirm_retries: u32,
    pub adopt_poll_interval: Duration,
    pub idle_exit_grace: Option<Duration>,
    pub clear_discovered_args_on_switch: bool,
}

impl From<&ServiceSettings> for SupervisorOptions {
    fn from(s: &ServiceSettings) -> Self {
        Self {
            kill_policy: KillPolicy {
                poll_interval: Duration::from_millis(s.kill_poll_interval_ms.max(1)),
                timeout: Duration::from_millis(s.kill_timeout_ms),
            },
            restart_confirm_retries: s.restart_confirm_retries,
            adopt_poll_interval: Duration::from_millis(s.adopt_poll_interval_ms.max(1)),
            idle_exit_grace: s.idle_exit_grace(),
            clear_discovered_args_on_switch: s.clear_discovered_args_on_switch,
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&ServiceSettings::default())
    }
}

/// Owns the proxied app's lifecycle.
///
/// `run`/`stop`/`restart`/`switch`/`reload` are serialized through
/// `op_lock`. `state` is only write-locked for short sections and never
/// across a kill-confirm wait; queries take the read lock.
pub struct Supervisor {
    store: Arc<ConfigStore>,
    tree: Arc<dyn ProcessTree>,
    launcher: Launcher,
    state: Arc<RwLock<SupervisorState>>,
    op_lock: Mutex<()>,
    events: mpsc::UnboundedSender<LaunchEvent>,
    idle: IdleTimer,
    shutdown: CancellationToken,
    options: SupervisorOptions,
}

impl Supervisor {
    /// Build the supervisor and start its event pump. Needs a tokio runtime.
    ///
    /// `extra_args` are the service's own startup arguments; they are
    /// appended to every launch for the lifetime of the process.
    pub fn new(
        store: Arc<ConfigStore>,
        tree: Arc<dyn ProcessTree>,
        options: SupervisorOptions,
        extra_args: Vec<String>,
    ) -> Arc<Self> {
        let active = store
            .snapshot()
            .map(|r| r.activate.clone())
            .unwrap_or_default();
        let state = Arc::new(RwLock::new(SupervisorState::new(active, Some(extra_args))));
        let shutdown = CancellationToken::new();
        let idle = IdleTimer::new(options.idle_exit_grace, state.clone(), shutdown.clone());
        let (events, mut rx) = mpsc::unbounded_channel::<LaunchEvent>();

        let sup = Arc::new(Self {
            store,
            tree,
            launcher: Launcher::new(),
            state,
            op_lock: Mutex::new(()),
            events,
            idle,
            shutdown,
            options,
        });

        // ── event pump ───────────────────────────────────────
        // 런처/감시 태스크의 전이는 모두 이 채널을 거쳐 상태에 반영됨
        let weak = Arc::downgrade(&sup);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(sup) = weak.upgrade() else {
                    break;
                };
                sup.apply_event(event).await;
            }
        });

        sup
    }

    async fn apply_event(&self, event: LaunchEvent) {
        let mut st = self.state.write().await;
        if st.apply(&event) {
            self.idle.sync(st.child_pid);
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ── config ───────────────────────────────────────────────

    /// 설정 파일 I/O 는 blocking 스레드에서
    async fn on_store<T, F>(&self, f: F) -> Result<T, ConfigError>
    where
        F: FnOnce(&ConfigStore) -> Result<T, ConfigError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let path = store.path().to_path_buf();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| ConfigError::Io {
                path,
                source: std::io::Error::other(e),
            })?
    }

    /// Current registry, re-read first if the file changed on disk.
    /// A failed re-read keeps the cached snapshot.
    async fn registry(&self) -> Result<Arc<Registry>, SupervisorError> {
        if let Err(e) = self.on_store(|s| s.reload()).await {
            tracing::warn!("Config refresh failed: {}", e);
        }
        self.store.snapshot().ok_or(SupervisorError::ConfigUnavailable)
    }

    // ── queries ──────────────────────────────────────────────

    pub async fn status(&self) -> String {
        self.state.read().await.status.label.to_string()
    }

    pub async fn child_pid(&self) -> u32 {
        self.state.read().await.child_pid
    }

    pub async fn active_app(&self) -> String {
        self.state.read().await.active_app.clone()
    }

    pub async fn discovered_args(&self) -> Option<Vec<String>> {
        self.state.read().await.discovered_args.clone()
    }

    pub fn idle_timer_armed(&self) -> bool {
        self.idle.is_armed()
    }

    pub async fn app_order(&self) -> Result<Vec<String>, SupervisorError> {
        let registry = self.registry().await?;
        Ok(registry.app_order())
    }

    /// The named app, or the active one when `name` is `None`.
    pub async fn app_info(&self, name: Option<&str>) -> Result<AppSpec, SupervisorError> {
        let registry = self.registry().await?;
        let name = match name {
            Some(n) => n.to_string(),
            None => self.active_app().await,
        };
        registry
            .get(&name)
            .cloned()
            .ok_or(SupervisorError::AppNotFound(name))
    }

    // ── operations ───────────────────────────────────────────

    /// Launch the active app with `call_args` appended. Refused with
    /// `AlreadyRunning` while a child is owned.
    pub async fn run(&self, call_args: Vec<String>) -> Result<u32, SupervisorError> {
        let _op = self.op_lock.lock().await;
        let call_args = (!call_args.is_empty()).then_some(call_args);
        self.run_locked(call_args.as_deref()).await
    }

    async fn run_locked(&self, call_args: Option<&[String]>) -> Result<u32, SupervisorError> {
        let registry = self.registry().await?;

        // spawn 동안 write lock 유지: 빠르게 끝나는 자식의 종료 이벤트가
        // Running 보다 먼저 반영되지 않도록
        let mut st = self.state.write().await;
        if st.child_pid != 0 {
            return Err(SupervisorError::AlreadyRunning { pid: st.child_pid });
        }
        let app = registry
            .get(&st.active_app)
            .cloned()
            .ok_or_else(|| SupervisorError::AppNotFound(st.active_app.clone()))?;

        let args = merge_args([
            Some(app.args.as_slice()),
            st.discovered_args.as_deref(),
            st.extra_args.as_deref(),
            call_args,
        ]);
        let launch_id = st.begin_launch().map_err(anyhow::Error::from)?;
        tracing::info!("Launching '{}': {} {:?}", app.name, app.path, args);

        match self.launcher.start(&app.path, &args, launch_id, self.events.clone()) {
            Ok(pid) => {
                st.apply(&LaunchEvent::running(launch_id, pid));
                self.idle.sync(st.child_pid);
                Ok(pid)
            }
            Err(e) => {
                tracing::error!("{}", e);
                st.apply(&LaunchEvent::start_failed(launch_id, e.reason.clone()));
                self.idle.sync(st.child_pid);
                Err(e.into())
            }
        }
    }

    /// Kill the owned tree and wait for confirmed death. No-op if nothing
    /// is owned.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await.map(|_| ())
    }

    /// Returns the owned PID and the members that were killed, or PID 0
    /// when nothing was owned.
    async fn stop_locked(&self) -> Result<(u32, BTreeSet<u32>), SupervisorError> {
        let pid = self.child_pid().await;
        if pid == 0 {
            tracing::debug!("Stop requested but no process is owned");
            return Ok((0, BTreeSet::new()));
        }
        tracing::info!("Stopping process tree {}", pid);
        // 잠금 없이 대기, 확인 후에만 상태 갱신
        let members = kill_tree_and_confirm(&self.tree, pid, self.options.kill_policy).await?;

        let mut st = self.state.write().await;
        st.mark_killed(pid);
        self.idle.sync(st.child_pid);
        Ok((pid, members))
    }

    /// Stop, re-confirm the old tree is gone, then launch again.
    pub async fn restart(&self) -> Result<u32, SupervisorError> {
        let _op = self.op_lock.lock().await;
        tracing::info!("Restarting '{}'", self.active_app().await);
        let (pid, members) = self.stop_locked().await?;
        if pid != 0 {
            self.confirm_gone(pid, &members).await?;
        }
        self.run_locked(None).await
    }

    /// Re-poll the killed members before launching again.
    async fn confirm_gone(&self, pid: u32, members: &BTreeSet<u32>) -> Result<(), SupervisorError> {
        let mut survivors = BTreeSet::new();
        for _ in 0..=self.options.restart_confirm_retries {
            survivors = live_members_async(&self.tree, members).await?;
            if survivors.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(self.options.kill_policy.poll_interval).await;
        }
        let survivors: Vec<u32> = survivors.into_iter().collect();
        tracing::error!("Process tree {} still alive after stop: {:?}", pid, survivors);
        Err(SupervisorError::TreeNotFullyTerminated { pid, survivors })
    }

    /// Make `name` the active app: confirmed kill of the owned tree,
    /// persist the new name, launch it.
    pub async fn switch(&self, name: &str) -> Result<u32, SupervisorError> {
        let _op = self.op_lock.lock().await;
        let registry = self.registry().await?;
        if registry.get(name).is_none() {
            return Err(SupervisorError::AppNotFound(name.to_string()));
        }

        let pid = self.child_pid().await;
        if pid != 0 {
            tracing::info!("Switching to '{}': terminating process tree {}", name, pid);
            kill_tree_and_confirm(&self.tree, pid, self.options.kill_policy).await?;
            let mut st = self.state.write().await;
            st.mark_killed(pid);
        }

        {
            let mut st = self.state.write().await;
            let previous = std::mem::replace(&mut st.active_app, name.to_string());
            if self.options.clear_discovered_args_on_switch && st.discovered_args.take().is_some() {
                tracing::info!("Discovered args cleared on switch");
            }
            tracing::info!("Active app: '{}' -> '{}'", previous, name);
        }
        let target = name.to_string();
        if let Err(e) = self.on_store(move |s| s.set_active(&target)).await {
            tracing::warn!("Failed to persist active app '{}': {}", name, e);
        }

        self.run_locked(None).await
    }

    /// Re-read the registry and adopt its `activate` value. The running
    /// child, if any, is left alone.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let _op = self.op_lock.lock().await;
        self.on_store(|s| s.force_reload()).await?;
        if let Some(registry) = self.store.snapshot() {
            let mut st = self.state.write().await;
            if st.active_app != registry.activate {
                tracing::info!(
                    "Active app changed on reload: '{}' -> '{}'",
                    st.active_app,
                    registry.activate
                );
                st.active_app = registry.activate.clone();
            }
        }
        Ok(())
    }

    /// Startup: adopt a running instance of the active app, or launch it.
    pub async fn bootstrap(&self) -> Result<(), SupervisorError> {
        let result = self.bootstrap_inner().await;
        let st = self.state.read().await;
        self.idle.sync(st.child_pid);
        result
    }

    async fn bootstrap_inner(&self) -> Result<(), SupervisorError> {
        let _op = self.op_lock.lock().await;
        let registry = self.registry().await?;
        let active = self.active_app().await;
        let app = registry
            .get(&active)
            .cloned()
            .ok_or(SupervisorError::AppNotFound(active))?;

        match find_by_executable_path_async(&self.tree, &app.path).await {
            Ok(Some(found)) => {
                tracing::info!(
                    "'{}' already running (PID {}), adopting with args {:?}",
                    app.name,
                    found.pid,
                    found.args()
                );
                let launch_id = {
                    let mut st = self.state.write().await;
                    let id = st.adopt(found.pid, found.args()).map_err(anyhow::Error::from)?;
                    self.idle.sync(st.child_pid);
                    id
                };
                self.watch_adopted(found.pid, launch_id);
                Ok(())
            }
            Ok(None) => self.run_locked(None).await.map(|_| ()),
            Err(e) => {
                let e = SupervisorError::from(e);
                tracing::warn!("{}; assuming '{}' is not running", e, app.name);
                self.run_locked(None).await.map(|_| ())
            }
        }
    }

    /// An adopted process is not our child and has no waiter; poll it.
    fn watch_adopted(&self, pid: u32, launch_id: u64) {
        let tree = self.tree.clone();
        let events = self.events.clone();
        let interval = self.options.adopt_poll_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !is_alive_async(&tree, pid).await {
                    tracing::info!("Adopted process {} is gone", pid);
                    let _ = events.send(LaunchEvent {
                        launch_id,
                        pid,
                        transition: Transition::Exited,
                        cause: Some("adopted process disappeared".into()),
                    });
                    return;
                }
            }
        });
    }

    /// Best-effort, non-confirming kill of the owned tree. Used on the way out.
    pub async fn kill_owned_tree_now(&self) {
        let pid = self.child_pid().await;
        if pid == 0 {
            return;
        }
        tracing::info!("Terminating owned process tree {}", pid);
        if let Err(e) = kill_tree_async(&self.tree, pid).await {
            tracing::warn!("{}", e);
        }
    }

    /// Kill the owned tree, then cancel the shutdown token shortly after
    /// so the caller's reply can still be written.
    pub fn request_exit(self: &Arc<Self>) {
        let sup = self.clone();
        tokio::spawn(async move {
            sup.kill_owned_tree_now().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            tracing::info!("Exit requested, shutting down");
            sup.shutdown.cancel();
        });
    }
}
