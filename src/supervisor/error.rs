//! Supervisor 전용 에러 타입. 에러 종류를 구분하여 제어 프로토콜에서
//! 한 줄짜리 `ERR <reason>` 응답으로 돌려줄 수 있게 합니다.

use crate::process_monitor::ProcessError;

use super::launcher::LaunchError;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("configuration unavailable")]
    ConfigUnavailable,

    #[error("app '{0}' not found")]
    AppNotFound(String),

    #[error("start failed: {path}: {reason}")]
    StartFailed { path: String, reason: String },

    #[error("process tree {pid} not fully terminated (alive: {survivors:?})")]
    TreeNotFullyTerminated { pid: u32, survivors: Vec<u32> },

    #[error("failed to kill process tree {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    #[error("process query failed: {0}")]
    ProcessQueryFailed(String),

    #[error("already running (PID={pid})")]
    AlreadyRunning { pid: u32 },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ProcessError> for SupervisorError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::KillFailed { pid, reason } => Self::KillFailed { pid, reason },
            ProcessError::TreeNotFullyTerminated { pid, survivors } => {
                Self::TreeNotFullyTerminated { pid, survivors }
            }
            ProcessError::QueryFailed(msg) => Self::ProcessQueryFailed(msg),
        }
    }
}

impl From<LaunchError> for SupervisorError {
    fn from(e: LaunchError) -> Self {
        Self::StartFailed {
            path: e.path,
            reason: e.reason,
        }
    }
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigUnavailable => "CONFIG_UNAVAILABLE",
            Self::AppNotFound(_) => "APP_NOT_FOUND",
            Self::StartFailed { .. } => "START_FAILED",
            Self::TreeNotFullyTerminated { .. } => "TREE_NOT_FULLY_TERMINATED",
            Self::KillFailed { .. } => "KILL_FAILED",
            Self::ProcessQueryFailed(_) => "PROCESS_QUERY_FAILED",
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 제어 프로토콜 응답 (`ERR <reason>`, 항상 한 줄)
    pub fn to_reply(&self) -> String {
        let reason = self.to_string().replace(['\r', '\n'], " ");
        format!("ERR {}", reason)
    }
}
