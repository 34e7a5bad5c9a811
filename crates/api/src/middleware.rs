use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use stocktake_core::BranchId;

use crate::context::BranchContext;

/// Header carrying the caller's branch scope.
pub const BRANCH_HEADER: &str = "x-branch-id";

/// Derive the branch context from the `X-Branch-Id` header.
///
/// Every domain route requires it; requests without a parseable branch id
/// never reach a handler.
pub async fn branch_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let branch_id = extract_branch(req.headers())?;

    req.extensions_mut().insert(BranchContext::new(branch_id));

    Ok(next.run(req).await)
}

fn extract_branch(headers: &HeaderMap) -> Result<BranchId, StatusCode> {
    let header = headers.get(BRANCH_HEADER).ok_or(StatusCode::BAD_REQUEST)?;

    let header = header.to_str().map_err(|_| StatusCode::BAD_REQUEST)?;

    header.trim().parse().map_err(|_| StatusCode::BAD_REQUEST)
}
