use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use stocktake_core::AggregateId;
use stocktake_infra::projections::RECEIPT_AGGREGATE;
use stocktake_products::ProductId;
use stocktake_receiving::{
    AddReceiptLine, CreateReceipt, GoodsReceipt, GoodsReceiptId, IssuedUnit, MarkLabelsPrinted,
    PostReceipt, ReceiptCommand, ReceiptStatus,
};
use stocktake_serials::{ScanMode, SerialNumber};
use stocktake_stock::StockUnitId;

use crate::app::routes::common;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_receipt))
        .route("/:id/lines", post(add_receipt_line))
        .route("/:id/post", post(post_receipt))
        .route("/:id/barcodes", get(get_barcodes))
        .route("/:id/barcodes/printed", post(mark_printed))
}

fn empty_receipt(aggregate_id: AggregateId) -> GoodsReceipt {
    GoodsReceipt::empty(GoodsReceiptId::new(aggregate_id))
}

pub async fn create_receipt(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Json(body): Json<dto::CreateReceiptRequest>,
) -> axum::response::Response {
    let agg = AggregateId::new();
    let receipt_id = GoodsReceiptId::new(agg);

    let cmd = ReceiptCommand::CreateReceipt(CreateReceipt {
        branch_id: branch.branch_id(),
        receipt_id,
        reference: body.reference,
        occurred_at: Utc::now(),
    });

    let mut committed_total = 0usize;
    let committed = match services.dispatch::<GoodsReceipt>(
        branch.branch_id(),
        agg,
        RECEIPT_AGGREGATE,
        cmd,
        |_b, aggregate_id| empty_receipt(aggregate_id),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };
    committed_total += committed.len();

    for line in body.lines {
        let prod_agg: AggregateId = match line.product_id.parse() {
            Ok(v) => v,
            Err(_) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid product id");
            }
        };
        let add_cmd = ReceiptCommand::AddReceiptLine(AddReceiptLine {
            branch_id: branch.branch_id(),
            receipt_id,
            product_id: ProductId::new(prod_agg),
            quantity: line.quantity,
            occurred_at: Utc::now(),
        });
        let committed = match services.dispatch::<GoodsReceipt>(
            branch.branch_id(),
            agg,
            RECEIPT_AGGREGATE,
            add_cmd,
            |_b, aggregate_id| empty_receipt(aggregate_id),
        ) {
            Ok(c) => c,
            Err(e) => return errors::dispatch_error_to_response(e),
        };
        committed_total += committed.len();
    }

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed_total,
        })),
    )
        .into_response()
}

pub async fn add_receipt_line(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ReceiptLineRequest>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid receipt id"),
    };
    let receipt_id = GoodsReceiptId::new(agg);

    let prod_agg: AggregateId = match body.product_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid product id"),
    };

    let cmd = ReceiptCommand::AddReceiptLine(AddReceiptLine {
        branch_id: branch.branch_id(),
        receipt_id,
        product_id: ProductId::new(prod_agg),
        quantity: body.quantity,
        occurred_at: Utc::now(),
    });

    let committed = match services.dispatch::<GoodsReceipt>(
        branch.branch_id(),
        agg,
        RECEIPT_AGGREGATE,
        cmd,
        |_b, aggregate_id| empty_receipt(aggregate_id),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({"id": agg.to_string(), "events_committed": committed.len()})),
    )
        .into_response()
}

/// Post a receipt: reserve one serial block per line, bind serials to fresh
/// stock units and commit the batch in a single `ReceiptPosted` event.
///
/// Supports `Idempotency-Key`: a retried post replays the first response
/// and never issues a second batch. If the dispatch fails after the blocks
/// were reserved, the blocks are retired (a gap in the numbering space).
pub async fn post_receipt(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid receipt id"),
    };
    let receipt_id = GoodsReceiptId::new(agg);

    let key = common::idempotency_key(&headers);
    if let Some(key) = &key {
        if let Some(stored) = services.idempotent_response(branch.branch_id(), key) {
            return (StatusCode::OK, Json(stored)).into_response();
        }
    }

    let state = match services.receipt_state(branch.branch_id(), receipt_id) {
        Ok(s) => s,
        Err(e) => return errors::dispatch_error_to_response(e),
    };
    if state.branch_id().is_none() {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "receipt not found");
    }
    if state.status() == ReceiptStatus::Posted {
        return errors::json_error(
            StatusCode::CONFLICT,
            "already_posted",
            "receipt has already been posted",
        );
    }

    // One contiguous block per line; the whole batch is issued or none.
    let mut issued: Vec<IssuedUnit> = Vec::new();
    let mut blocks = Vec::new();
    for line in state.lines() {
        let block = match services.reserve_serials(line.quantity) {
            Ok(b) => b,
            Err(e) => {
                return errors::json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "sequence_error",
                    e.to_string(),
                );
            }
        };
        for serial in block.serials() {
            issued.push(IssuedUnit {
                unit_id: StockUnitId::new(AggregateId::new()),
                serial,
                product_id: line.product_id,
                line_no: line.line_no,
            });
        }
        blocks.push(block);
    }

    let cmd = ReceiptCommand::PostReceipt(PostReceipt {
        branch_id: branch.branch_id(),
        receipt_id,
        issued: issued.clone(),
        occurred_at: Utc::now(),
    });

    let committed = match services.dispatch::<GoodsReceipt>(
        branch.branch_id(),
        agg,
        RECEIPT_AGGREGATE,
        cmd,
        |_b, aggregate_id| empty_receipt(aggregate_id),
    ) {
        Ok(c) => c,
        Err(e) => {
            // Reserved serials are never reused after a failed post.
            for block in &blocks {
                tracing::warn!(
                    start = block.start,
                    quantity = block.quantity,
                    "retiring reserved serial block after failed post"
                );
            }
            return errors::dispatch_error_to_response(e);
        }
    };

    let response = serde_json::json!({
        "id": agg.to_string(),
        "units": issued.iter().map(dto::issued_unit_to_json).collect::<Vec<_>>(),
        "events_committed": committed.len(),
    });

    if let Some(key) = &key {
        services.record_idempotent_response(branch.branch_id(), key, response.clone());
    }

    (StatusCode::OK, Json(response)).into_response()
}

pub async fn get_barcodes(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
    Query(params): Query<dto::BarcodesParams>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid receipt id"),
    };
    let receipt_id = GoodsReceiptId::new(agg);
    let copies = params.copies.unwrap_or(1);

    let items = services
        .catalog_for_receipt(branch.branch_id(), receipt_id)
        .into_iter()
        .map(dto::catalog_row_to_json)
        .collect::<Vec<_>>();
    let labels = services
        .labels_for_receipt(branch.branch_id(), receipt_id, copies)
        .iter()
        .map(dto::label_to_json)
        .collect::<Vec<_>>();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "items": items,
            "labels": labels,
        })),
    )
        .into_response()
}

/// Acknowledge printed labels (whole receipt or an explicit serial list).
///
/// Idempotent: repeating the acknowledgment marks nothing new and commits
/// no event.
pub async fn mark_printed(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(branch): Extension<crate::context::BranchContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::MarkPrintedRequest>,
) -> axum::response::Response {
    let agg: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid receipt id"),
    };
    let receipt_id = GoodsReceiptId::new(agg);

    let serials = match body.serials {
        None => None,
        Some(raw) => {
            let mut parsed = Vec::with_capacity(raw.len());
            for s in &raw {
                let mode = if s.starts_with("SN-") { ScanMode::Barcode } else { ScanMode::Sn };
                match SerialNumber::parse(s, mode) {
                    Ok(serial) => parsed.push(serial),
                    Err(_) => {
                        return errors::json_error(
                            StatusCode::BAD_REQUEST,
                            "invalid_serial",
                            format!("unparseable serial: {s}"),
                        );
                    }
                }
            }
            Some(parsed)
        }
    };

    let cmd = ReceiptCommand::MarkLabelsPrinted(MarkLabelsPrinted {
        branch_id: branch.branch_id(),
        receipt_id,
        serials,
        occurred_at: Utc::now(),
    });

    let committed = match services.dispatch::<GoodsReceipt>(
        branch.branch_id(),
        agg,
        RECEIPT_AGGREGATE,
        cmd,
        |_b, aggregate_id| empty_receipt(aggregate_id),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}
