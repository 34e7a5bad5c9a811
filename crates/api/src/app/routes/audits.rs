use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use stocktake_audit::{
    AuditSession, AuditSessionId, ConfirmAudit, ExpectedUnit, RecordScan, SessionCommand,
    SessionEvent, StartAudit,
};
use stocktake_core::AggregateId;
use stocktake_infra::command_dispatcher::DispatchError;
use stocktake_infra::open_audits::ClaimOutcome;
use stocktake_infra::projections::{AUDIT_AGGREGATE, AuditItemsQuery};
use stocktake_serials::SerialNumber;

use crate::app::routes::common;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

const SCAN_RETRIES: u32 = 3;

pub fn router() -> Router {
    Router::new()
        .route("/", post(start_audit))
        .route("/:id", get(get_audit))
        .route("/:id/scans", post(record_scan))
        .route("/:id/items", get(list_items))
        .route("/:id/confirm", post(confirm_audit))
}

fn empty_session(aggregate_id: AggregateId) -> AuditSession {
    AuditSession::empty(AuditSessionId::new(aggregate_id))
}

/// Start an audit session (idempotent per branch).
///
/// The expected snapshot is every on-shelf unit of the branch at this
/// moment, denormalized with product names so the session never re-queries
/// live stock. When a draft session already holds the branch slot, it is
/// returned with `reused: true` instead of starting a second count.
pub async fn start_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
) -> axum::response::Response {
    let agg = AggregateId::new();
    let session_id = AuditSessionId::new(agg);

    match services.claim_open_audit(branch.branch_id(), session_id) {
        Ok(ClaimOutcome::ExistingOpen(existing)) => {
            // Count from the committed stream, not the projection: the read
            // model may still lag the start that claimed the slot.
            let expected = match services.session_state(branch.branch_id(), existing) {
                Ok(state) => state.expected_count(),
                Err(e) => return errors::dispatch_error_to_response(e),
            };
            return (
                StatusCode::OK,
                Json(serde_json::json!({
                    "session_id": existing.0.to_string(),
                    "expected_count": expected,
                    "reused": true,
                })),
            )
                .into_response();
        }
        Ok(ClaimOutcome::Claimed) => {}
        Err(e) => {
            return errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "registry_error",
                e.to_string(),
            );
        }
    }

    let expected: Vec<ExpectedUnit> = services
        .stock_on_shelf(branch.branch_id())
        .into_iter()
        .map(|unit| {
            let product_name = services
                .products_get(branch.branch_id(), &unit.product_id)
                .map(|p| p.name)
                .unwrap_or_default();
            ExpectedUnit {
                unit_id: unit.id,
                serial: unit.serial,
                product_id: unit.product_id,
                product_name,
            }
        })
        .collect();
    let expected_count = expected.len();

    let cmd = SessionCommand::StartAudit(StartAudit {
        branch_id: branch.branch_id(),
        session_id,
        expected,
        occurred_at: Utc::now(),
    });

    if let Err(e) = services.dispatch::<AuditSession>(
        branch.branch_id(),
        agg,
        AUDIT_AGGREGATE,
        cmd,
        |_b, aggregate_id| empty_session(aggregate_id),
    ) {
        // Free the slot so the branch is not locked out by a failed start.
        if let Err(release_err) = services.release_open_audit(branch.branch_id(), session_id) {
            tracing::warn!("failed to release audit slot after failed start: {release_err}");
        }
        return errors::dispatch_error_to_response(e);
    }

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "session_id": agg.to_string(),
            "expected_count": expected_count,
            "reused": false,
        })),
    )
        .into_response()
}

pub async fn get_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid session id"),
    };
    let session_id = AuditSessionId::new(agg);
    match services.sessions_get(branch.branch_id(), &session_id) {
        Some(row) => (StatusCode::OK, Json(dto::session_overview_to_json(&row))).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "audit session not found"),
    }
}

/// Record one scan against the session snapshot.
///
/// Codes that were never issued resolve to nothing and return 404; codes of
/// issued units outside the snapshot, including units that belong to another
/// branch, are recorded with outcome `UNEXPECTED`.
/// The classification itself happens inside the aggregate under the
/// stream's optimistic concurrency check.
pub async fn record_scan(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ScanRequest>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid session id"),
    };
    let session_id = AuditSessionId::new(agg);

    let mode = match dto::parse_scan_mode(&body.mode) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    let serial = match SerialNumber::parse(&body.code, mode) {
        Ok(s) => s,
        Err(_) => {
            return errors::json_error(StatusCode::NOT_FOUND, "unknown_code", "code was never issued");
        }
    };

    // Serials live in one global numbering space. A code issued to another
    // branch still resolves here; the aggregate then classifies it as
    // unexpected. Only a code that was never issued anywhere is a 404.
    let (_owner, row) = match services.catalog_resolve_anywhere(serial) {
        Some(found) => found,
        None => {
            return errors::json_error(StatusCode::NOT_FOUND, "unknown_code", "code was never issued");
        }
    };

    let cmd = SessionCommand::RecordScan(RecordScan {
        branch_id: branch.branch_id(),
        session_id,
        serial,
        code: body.code,
        mode,
        occurred_at: Utc::now(),
    });

    let committed = match services.dispatch_retrying::<AuditSession>(
        branch.branch_id(),
        agg,
        AUDIT_AGGREGATE,
        cmd,
        |_b, aggregate_id| empty_session(aggregate_id),
        SCAN_RETRIES,
    ) {
        Ok(c) => c,
        Err(DispatchError::Conflict(msg)) => {
            return errors::json_error(StatusCode::CONFLICT, "session_closed", msg);
        }
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    let outcome = committed
        .first()
        .and_then(|stored| serde_json::from_value::<SessionEvent>(stored.payload.clone()).ok())
        .and_then(|event| match event {
            SessionEvent::ScanRecorded(e) => Some(e.outcome),
            _ => None,
        });
    let Some(outcome) = outcome else {
        return errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "scan_error",
            "scan did not record an outcome",
        );
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "outcome": outcome,
            "serial": serial.as_sn(),
            "code": serial.as_label_code(),
            "unit": {
                "unit_id": row.unit_id.0.to_string(),
                "product_id": row.product_id.0.to_string(),
            },
        })),
    )
        .into_response()
}

pub async fn list_items(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
    Query(params): Query<dto::ItemsParams>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid session id"),
    };
    let session_id = AuditSessionId::new(agg);

    let query = AuditItemsQuery {
        scanned: params.scanned,
        q: params.q,
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(50),
    };

    match services.sessions_items(branch.branch_id(), &session_id, &query) {
        Some(page) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": page.items.into_iter().map(dto::audit_item_to_json).collect::<Vec<_>>(),
                "total": page.total,
                "page": page.page,
                "page_size": page.page_size,
            })),
        )
            .into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "audit session not found"),
    }
}

/// Confirm the session: close it and resolve everything still missing.
///
/// Supports `Idempotency-Key` replay; a second confirm with a fresh key
/// hits the closed session and returns 409.
pub async fn confirm_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<dto::ConfirmRequest>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid session id"),
    };
    let session_id = AuditSessionId::new(agg);

    let key = common::idempotency_key(&headers);
    if let Some(key) = &key {
        if let Some(stored) = services.idempotent_response(branch.branch_id(), key) {
            return (StatusCode::OK, Json(stored)).into_response();
        }
    }

    let strategy = match dto::parse_strategy(&body.strategy) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let cmd = SessionCommand::ConfirmAudit(ConfirmAudit {
        branch_id: branch.branch_id(),
        session_id,
        strategy,
        occurred_at: Utc::now(),
    });

    let committed = match services.dispatch::<AuditSession>(
        branch.branch_id(),
        agg,
        AUDIT_AGGREGATE,
        cmd,
        |_b, aggregate_id| empty_session(aggregate_id),
    ) {
        Ok(c) => c,
        Err(DispatchError::Conflict(msg)) => {
            return errors::json_error(StatusCode::CONFLICT, "already_confirmed", msg);
        }
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    // The branch may start a new count now.
    if let Err(e) = services.release_open_audit(branch.branch_id(), session_id) {
        tracing::warn!("failed to release audit slot after confirm: {e}");
    }

    let missing = committed
        .first()
        .and_then(|stored| serde_json::from_value::<SessionEvent>(stored.payload.clone()).ok())
        .and_then(|event| match event {
            SessionEvent::AuditConfirmed(e) => Some(e.missing.len()),
            _ => None,
        })
        .unwrap_or(0);

    let response = serde_json::json!({
        "session_id": agg.to_string(),
        "status": "confirmed",
        "strategy": strategy,
        "missing": missing,
    });

    if let Some(key) = &key {
        services.record_idempotent_response(branch.branch_id(), key, response.clone());
    }

    (StatusCode::OK, Json(response)).into_response()
}
