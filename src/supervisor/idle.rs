//! Idle-exit timer.
//!
//! Two states: armed (no child owned, countdown running) and disarmed.
//! [`IdleTimer::sync`] is called after every state mutation with the
//! current owned PID; it arms on `0` and disarms otherwise. When the
//! countdown expires the owned PID is checked once more and the service
//! shutdown token is cancelled if it is still `0`.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::state_machine::SupervisorState;

pub struct IdleTimer {
    /// `None` = idle exit disabled
    grace: Option<Duration>,
    state: Arc<RwLock<SupervisorState>>,
    shutdown: CancellationToken,
    armed: Mutex<Option<CancellationToken>>,
}

impl IdleTimer {
    pub fn new(
        grace: Option<Duration>,
        state: Arc<RwLock<SupervisorState>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            grace,
            state,
            shutdown,
            armed: Mutex::new(None),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    /// Arm on `child_pid == 0`, disarm otherwise. Arming an already
    /// running countdown does not restart it.
    pub fn sync(&self, child_pid: u32) {
        let Some(grace) = self.grace else {
            return;
        };
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());

        if child_pid != 0 {
            if let Some(token) = armed.take() {
                if !token.is_cancelled() {
                    tracing::debug!("Idle timer disarmed (PID {} owned)", child_pid);
                }
                token.cancel();
            }
            return;
        }

        if armed.as_ref().map(|t| !t.is_cancelled()).unwrap_or(false) {
            return;
        }

        let token = CancellationToken::new();
        *armed = Some(token.clone());
        tracing::info!("No app running; service exits in {:?} unless one starts", grace);

        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    token.cancel();
                    let child_pid = state.read().await.child_pid;
                    if child_pid == 0 {
                        tracing::info!("Idle for {:?}, shutting down", grace);
                        shutdown.cancel();
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(grace: Option<Duration>) -> (IdleTimer, Arc<RwLock<SupervisorState>>, CancellationToken) {
        let state = Arc::new(RwLock::new(SupervisorState::new("A", None)));
        let shutdown = CancellationToken::new();
        (IdleTimer::new(grace, state.clone(), shutdown.clone()), state, shutdown)
    }

    #[tokio::test]
    async fn test_expires_when_nothing_runs() {
        let (idle, _state, shutdown) = timer(Some(Duration::from_millis(50)));
        idle.sync(0);
        assert!(idle.is_armed());
        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .expect("idle exit should fire");
        assert!(!idle.is_armed());
    }

    #[tokio::test]
    async fn test_run_before_deadline_cancels_exit() {
        let (idle, _state, shutdown) = timer(Some(Duration::from_millis(150)));
        idle.sync(0);
        idle.sync(1234);
        assert!(!idle.is_armed());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_rearming_keeps_first_deadline() {
        let (idle, _state, shutdown) = timer(Some(Duration::from_millis(200)));
        idle.sync(0);
        tokio::time::sleep(Duration::from_millis(120)).await;
        // 이미 대기 중이면 다시 시작하지 않음
        idle.sync(0);
        tokio::time::timeout(Duration::from_millis(1_000), shutdown.cancelled())
            .await
            .expect("first countdown should still fire");
    }

    #[tokio::test]
    async fn test_expiry_rechecks_owned_pid() {
        let (idle, state, shutdown) = timer(Some(Duration::from_millis(50)));
        idle.sync(0);
        {
            // 타이머를 거치지 않고 자식이 붙은 경우
            let mut st = state.write().await;
            st.adopt(4321, Vec::new()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_disabled_never_arms() {
        let (idle, _state, shutdown) = timer(None);
        idle.sync(0);
        assert!(!idle.is_armed());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_cancelled());
    }
}
