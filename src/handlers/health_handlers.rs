//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata db and the data dir

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe. Always 200 with a small JSON body, never touches disk.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness checks, keyed in the response:
/// - `sqlite`: `SELECT 1` through the metadata pool, with busy retries.
/// - `disk`: a scratch file written, read back and removed under the data dir.
/// - `free_space`: the writer free-space threshold.
///
/// HTTP 200 when all checks pass, 503 otherwise. The WAL size is reported
/// alongside so operators can see checkpointing at work.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    checks.insert("sqlite", probe_metadata(&service).await);
    checks.insert("disk", probe_data_dir(service.base_path()).await);
    checks.insert(
        "free_space",
        CheckStatus::from_result(service.context().ensure_free_space()),
    );
    let ready = checks.values().all(|c| c.ok);

    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" }.into(),
        checks,
        wal_size: service.store().wal().wal_size().await,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_metadata(service: &StorageService) -> CheckStatus {
    let store = service.store();
    let pool = store.pool();
    let res = store
        .retry(move || async move {
            Ok(sqlx::query_scalar::<_, i64>("SELECT 1")
                .fetch_one(pool)
                .await?)
        })
        .await;
    match res {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {v}")),
        Err(e) => CheckStatus::failed(e),
    }
}

/// Round-trips a scratch file through the data dir. The file is removed
/// whatever the outcome.
async fn probe_data_dir(base: &Path) -> CheckStatus {
    const PROBE: &[u8] = b"readyz";
    let scratch = base.join(format!(".readyz-{}", Uuid::new_v4()));
    let outcome = async {
        fs::write(&scratch, PROBE).await?;
        let back = fs::read(&scratch).await?;
        Ok::<bool, std::io::Error>(back == PROBE)
    }
    .await;
    let cleanup = fs::remove_file(&scratch).await;
    match (outcome, cleanup) {
        (Ok(true), Ok(())) => CheckStatus::ok(),
        (Ok(true), Err(e)) => CheckStatus {
            ok: true,
            error: Some(format!("scratch file left behind: {e}")),
        },
        (Ok(false), _) => CheckStatus::failed("scratch file content mismatch"),
        (Err(e), _) => CheckStatus::failed(e),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
    wal_size: u64,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(err: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            error: Some(err.to_string()),
        }
    }

    fn from_result<E: std::fmt::Display>(res: Result<(), E>) -> Self {
        match res {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e),
        }
    }
}
