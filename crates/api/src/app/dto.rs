use axum::http::StatusCode;
use serde::Deserialize;

use stocktake_audit::ResolutionStrategy;
use stocktake_infra::projections::{AuditItemRow, AuditSessionRow, CatalogRow, ProductRow};
use stocktake_receiving::IssuedUnit;
use stocktake_serials::{PrintableLabel, ScanMode};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub sku: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ReceiptLineRequest {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct CreateReceiptRequest {
    pub reference: Option<String>,
    #[serde(default)]
    pub lines: Vec<ReceiptLineRequest>,
}

#[derive(Debug, Deserialize)]
pub struct MarkPrintedRequest {
    /// `None` acknowledges every label of the receipt.
    pub serials: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct BarcodesParams {
    pub copies: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub code: String,
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub strategy: String,
}

#[derive(Debug, Deserialize)]
pub struct ItemsParams {
    pub scanned: Option<bool>,
    pub q: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

// -------------------------
// Body field parsing
// -------------------------

pub fn parse_scan_mode(s: &str) -> Result<ScanMode, axum::response::Response> {
    match s.to_lowercase().as_str() {
        "barcode" => Ok(ScanMode::Barcode),
        "sn" => Ok(ScanMode::Sn),
        _ => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_scan_mode",
            "mode must be one of: barcode, sn",
        )),
    }
}

pub fn parse_strategy(s: &str) -> Result<ResolutionStrategy, axum::response::Response> {
    match s.to_lowercase().as_str() {
        "mark_pending" => Ok(ResolutionStrategy::MarkPending),
        "mark_lost" => Ok(ResolutionStrategy::MarkLost),
        _ => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_strategy",
            "strategy must be one of: mark_pending, mark_lost",
        )),
    }
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn product_to_json(rm: ProductRow) -> serde_json::Value {
    serde_json::json!({
        "id": rm.product_id.0.to_string(),
        "sku": rm.sku,
        "name": rm.name,
    })
}

pub fn issued_unit_to_json(unit: &IssuedUnit) -> serde_json::Value {
    serde_json::json!({
        "unit_id": unit.unit_id.0.to_string(),
        "serial": unit.serial.as_sn(),
        "code": unit.serial.as_label_code(),
        "product_id": unit.product_id.0.to_string(),
        "line_no": unit.line_no,
    })
}

pub fn catalog_row_to_json(row: CatalogRow) -> serde_json::Value {
    serde_json::json!({
        "serial": row.serial.as_sn(),
        "code": row.serial.as_label_code(),
        "unit_id": row.unit_id.0.to_string(),
        "product_id": row.product_id.0.to_string(),
        "receipt_id": row.receipt_id.0.to_string(),
        "printed": row.printed,
        "printed_at": row.printed_at,
    })
}

pub fn label_to_json(label: &PrintableLabel) -> serde_json::Value {
    serde_json::json!({
        "serial": label.serial.as_sn(),
        "code": label.code,
        "copy": label.copy,
    })
}

pub fn session_overview_to_json(row: &AuditSessionRow) -> serde_json::Value {
    serde_json::json!({
        "session_id": row.session_id.0.to_string(),
        "status": row.status,
        "expected": row.expected_count(),
        "scanned": row.scanned_count(),
        "missing": row.missing_count(),
        "started_at": row.started_at,
        "confirmed_at": row.confirmed_at,
        "strategy": row.strategy,
    })
}

pub fn audit_item_to_json(item: AuditItemRow) -> serde_json::Value {
    serde_json::json!({
        "unit_id": item.unit_id.0.to_string(),
        "serial": item.serial.as_sn(),
        "code": item.serial.as_label_code(),
        "product_id": item.product_id.0.to_string(),
        "product_name": item.product_name,
        "scanned": item.scanned,
        "scanned_at": item.scanned_at,
    })
}
