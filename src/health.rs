use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fred::interfaces::ClientLike;
use serde::Serialize;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub keydb: CheckResult,
    pub storage: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub config: Arc<Config>,
    /// Present only when a KeyDB backend is configured.
    pub keydb: Option<fred::clients::Pool>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_keydb(pool: Option<&fred::clients::Pool>) -> CheckResult {
    let Some(pool) = pool else {
        return CheckResult {
            ok: true,
            detail: Some("not configured".to_string()),
        };
    };
    match pool.ping::<String>(None).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

async fn check_storage(config: &Config) -> CheckResult {
    let dirs = vec![
        config.storage.small_files_dir.clone(),
        config.storage.layers_dir.clone(),
    ];
    match tokio::task::spawn_blocking(move || check_writable(&dirs)).await {
        Ok(Ok(())) => CheckResult::healthy(),
        Ok(Err(e)) => CheckResult::unhealthy(format!("{e:#}")),
        Err(e) => CheckResult::unhealthy(format!("storage check task failed: {e}")),
    }
}

/// Create and drop a temp file in each directory.
fn check_writable(dirs: &[PathBuf]) -> anyhow::Result<()> {
    use anyhow::Context;

    for dir in dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
        tempfile::tempfile_in(dir).with_context(|| format!("{} is not writable", dir.display()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.keydb.ok && checks.storage.ok {
        HealthStatus::Ok
    } else if !checks.keydb.ok {
        // Locks and the shared store live in KeyDB when it is configured.
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (keydb, storage) = tokio::join!(
        check_keydb(state.keydb.as_ref()),
        check_storage(&state.config),
    );

    let checks = HealthChecks { keydb, storage };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keydb_failure_is_unhealthy_storage_failure_degraded() {
        let checks = HealthChecks {
            keydb: CheckResult::healthy(),
            storage: CheckResult::unhealthy("read-only"),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);

        let checks = HealthChecks {
            keydb: CheckResult::unhealthy("PING failed"),
            storage: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }

    #[test]
    fn writable_check_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        check_writable(&[nested.clone()]).unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn unconfigured_keydb_is_ok() {
        let check = check_keydb(None).await;
        assert!(check.ok);
        assert_eq!(check.detail.as_deref(), Some("not configured"));
    }
}
