use reqwest::StatusCode;
use serde_json::json;

use stocktake_core::BranchId;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Build app (same router as prod), but bind to an ephemeral port.
        let app = stocktake_api::app::build_app().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn branch() -> String {
    BranchId::new().to_string()
}

async fn create_product(
    client: &reqwest::Client,
    base_url: &str,
    branch: &str,
    sku: &str,
    name: &str,
) -> String {
    let res = client
        .post(format!("{}/products", base_url))
        .header("X-Branch-Id", branch)
        .json(&json!({ "sku": sku, "name": name }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

async fn create_and_post_receipt(
    client: &reqwest::Client,
    base_url: &str,
    branch: &str,
    product_id: &str,
    quantity: u32,
) -> (String, Vec<String>) {
    let res = client
        .post(format!("{}/receipts", base_url))
        .header("X-Branch-Id", branch)
        .json(&json!({
            "reference": "delivery-note-1",
            "lines": [{ "product_id": product_id, "quantity": quantity }],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    let receipt_id = created["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("{}/receipts/{}/post", base_url, receipt_id))
        .header("X-Branch-Id", branch)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let posted: serde_json::Value = res.json().await.unwrap();
    let codes = posted["units"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["code"].as_str().unwrap().to_string())
        .collect();

    (receipt_id, codes)
}

/// Poll the barcode catalog until the receipt's rows are visible.
///
/// The API is intentionally eventual-consistent (command path vs projection
/// update), so reads right after a post may lag briefly.
async fn barcodes_eventually(
    client: &reqwest::Client,
    base_url: &str,
    branch: &str,
    receipt_id: &str,
    expected_items: usize,
) -> serde_json::Value {
    for _ in 0..50 {
        let res = client
            .get(format!("{}/receipts/{}/barcodes", base_url, receipt_id))
            .header("X-Branch-Id", branch)
            .send()
            .await
            .unwrap();

        if res.status() == StatusCode::OK {
            let body: serde_json::Value = res.json().await.unwrap();
            if body["items"].as_array().unwrap().len() == expected_items {
                return body;
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("barcode rows did not become visible in projection within timeout");
}

async fn overview_eventually(
    client: &reqwest::Client,
    base_url: &str,
    branch: &str,
    session_id: &str,
    scanned: u64,
) -> serde_json::Value {
    for _ in 0..50 {
        let res = client
            .get(format!("{}/audits/{}", base_url, session_id))
            .header("X-Branch-Id", branch)
            .send()
            .await
            .unwrap();

        if res.status() == StatusCode::OK {
            let body: serde_json::Value = res.json().await.unwrap();
            if body["scanned"].as_u64().unwrap() == scanned {
                return body;
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("audit overview did not reach scanned={scanned} within timeout");
}

async fn scan(
    client: &reqwest::Client,
    base_url: &str,
    branch: &str,
    session_id: &str,
    code: &str,
) -> reqwest::Response {
    client
        .post(format!("{}/audits/{}/scans", base_url, session_id))
        .header("X-Branch-Id", branch)
        .json(&json!({ "code": code, "mode": "barcode" }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn branch_header_required_for_domain_routes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/products", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Liveness stays open.
    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn posting_a_receipt_issues_serials_and_fills_the_catalog() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let branch = branch();

    let product_id = create_product(&client, &srv.base_url, &branch, "SKU-1", "Widget").await;
    let (receipt_id, codes) =
        create_and_post_receipt(&client, &srv.base_url, &branch, &product_id, 3).await;

    assert_eq!(codes.len(), 3);
    let unique: std::collections::BTreeSet<_> = codes.iter().collect();
    assert_eq!(unique.len(), 3, "issued codes must be distinct");

    let body = barcodes_eventually(&client, &srv.base_url, &branch, &receipt_id, 3).await;
    for item in body["items"].as_array().unwrap() {
        assert_eq!(item["printed"], false);
        assert_eq!(item["product_id"].as_str().unwrap(), product_id);
    }

    // Two copies per record expand to six labels without allocating serials.
    let res = client
        .get(format!(
            "{}/receipts/{}/barcodes?copies=2",
            srv.base_url, receipt_id
        ))
        .header("X-Branch-Id", &branch)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["labels"].as_array().unwrap().len(), 6);
    assert_eq!(body["items"].as_array().unwrap().len(), 3);

    // Acknowledge printing; the second acknowledgment is a no-op.
    let res = client
        .post(format!(
            "{}/receipts/{}/barcodes/printed",
            srv.base_url, receipt_id
        ))
        .header("X-Branch-Id", &branch)
        .json(&json!({ "serials": null }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["events_committed"], 1);

    let res = client
        .post(format!(
            "{}/receipts/{}/barcodes/printed",
            srv.base_url, receipt_id
        ))
        .header("X-Branch-Id", &branch)
        .json(&json!({ "serials": null }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["events_committed"], 0);
}

#[tokio::test]
async fn post_with_idempotency_key_replays_the_first_response() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let branch = branch();

    let product_id = create_product(&client, &srv.base_url, &branch, "SKU-1", "Widget").await;
    let res = client
        .post(format!("{}/receipts", srv.base_url))
        .header("X-Branch-Id", &branch)
        .json(&json!({ "lines": [{ "product_id": product_id, "quantity": 2 }] }))
        .send()
        .await
        .unwrap();
    let receipt_id = res.json::<serde_json::Value>().await.unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    let post_url = format!("{}/receipts/{}/post", srv.base_url, receipt_id);
    let res = client
        .post(&post_url)
        .header("X-Branch-Id", &branch)
        .header("Idempotency-Key", "post-attempt-1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let first: serde_json::Value = res.json().await.unwrap();

    // Retried post returns the stored response, no second batch.
    let res = client
        .post(&post_url)
        .header("X-Branch-Id", &branch)
        .header("Idempotency-Key", "post-attempt-1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let second: serde_json::Value = res.json().await.unwrap();
    assert_eq!(first, second);

    // Without a key, the already-posted receipt is a conflict.
    let res = client
        .post(&post_url)
        .header("X-Branch-Id", &branch)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn audit_lifecycle_scan_classification_and_confirm() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let branch = branch();

    // Three expected units: A, B, C.
    let product_id = create_product(&client, &srv.base_url, &branch, "SKU-1", "Widget").await;
    let (receipt_id, codes) =
        create_and_post_receipt(&client, &srv.base_url, &branch, &product_id, 3).await;
    barcodes_eventually(&client, &srv.base_url, &branch, &receipt_id, 3).await;

    // Start; a second start reuses the open session.
    let res = client
        .post(format!("{}/audits", srv.base_url))
        .header("X-Branch-Id", &branch)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let started: serde_json::Value = res.json().await.unwrap();
    assert_eq!(started["reused"], false);
    assert_eq!(started["expected_count"], 3);
    let session_id = started["session_id"].as_str().unwrap().to_string();

    overview_eventually(&client, &srv.base_url, &branch, &session_id, 0).await;

    let res = client
        .post(format!("{}/audits", srv.base_url))
        .header("X-Branch-Id", &branch)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let reused: serde_json::Value = res.json().await.unwrap();
    assert_eq!(reused["reused"], true);
    assert_eq!(reused["session_id"].as_str().unwrap(), session_id);
    assert_eq!(reused["expected_count"], 3);

    // Scan A twice: first match, then an idempotent repeat.
    let res = scan(&client, &srv.base_url, &branch, &session_id, &codes[0]).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "MATCHED");

    let res = scan(&client, &srv.base_url, &branch, &session_id, &codes[0]).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "ALREADY_SCANNED");

    // D: issued after the snapshot was frozen, so it scans as unexpected.
    let (foreign_receipt, foreign_codes) =
        create_and_post_receipt(&client, &srv.base_url, &branch, &product_id, 1).await;
    barcodes_eventually(&client, &srv.base_url, &branch, &foreign_receipt, 1).await;

    let res = scan(&client, &srv.base_url, &branch, &session_id, &foreign_codes[0]).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "UNEXPECTED");

    // A code that was never issued is not found at all.
    let res = scan(&client, &srv.base_url, &branch, &session_id, "SN-999999999999").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_code");

    // Reconciliation arithmetic holds: 3 expected = 1 scanned + 2 missing.
    let overview = overview_eventually(&client, &srv.base_url, &branch, &session_id, 1).await;
    assert_eq!(overview["expected"], 3);
    assert_eq!(overview["missing"], 2);
    assert_eq!(overview["status"], "draft");

    // Stable-ordered, filterable item listing.
    let res = client
        .get(format!(
            "{}/audits/{}/items?scanned=false&page=2&page_size=1",
            srv.base_url, session_id
        ))
        .header("X-Branch-Id", &branch)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["total"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["page"], 2);

    // Confirm resolves the two missing units.
    let res = client
        .post(format!("{}/audits/{}/confirm", srv.base_url, session_id))
        .header("X-Branch-Id", &branch)
        .json(&json!({ "strategy": "mark_pending" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["missing"], 2);

    // The session is closed: no more scans, no second confirm.
    let res = scan(&client, &srv.base_url, &branch, &session_id, &codes[1]).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "session_closed");

    let res = client
        .post(format!("{}/audits/{}/confirm", srv.base_url, session_id))
        .header("X-Branch-Id", &branch)
        .json(&json!({ "strategy": "mark_lost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "already_confirmed");
}

#[tokio::test]
async fn branches_are_isolated() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let branch1 = branch();
    let branch2 = branch();

    let product_id = create_product(&client, &srv.base_url, &branch1, "SKU-1", "Widget").await;
    let (receipt_id, codes) =
        create_and_post_receipt(&client, &srv.base_url, &branch1, &product_id, 2).await;
    barcodes_eventually(&client, &srv.base_url, &branch1, &receipt_id, 2).await;

    // Branch 2 sees neither the catalog rows nor the product.
    let res = client
        .get(format!("{}/receipts/{}/barcodes", srv.base_url, receipt_id))
        .header("X-Branch-Id", &branch2)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["items"].as_array().unwrap().is_empty());

    let res = client
        .get(format!("{}/products", srv.base_url))
        .header("X-Branch-Id", &branch2)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["items"].as_array().unwrap().is_empty());

    // Each branch can hold its own open audit.
    let res = client
        .post(format!("{}/audits", srv.base_url))
        .header("X-Branch-Id", &branch1)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = client
        .post(format!("{}/audits", srv.base_url))
        .header("X-Branch-Id", &branch2)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let started: serde_json::Value = res.json().await.unwrap();
    assert_eq!(started["reused"], false);
    assert_eq!(started["expected_count"], 0);
    let session2 = started["session_id"].as_str().unwrap().to_string();

    // Serials are global: a unit belonging to branch 1 is a real code in
    // branch 2's audit, just out of scope.
    let res = scan(&client, &srv.base_url, &branch2, &session2, &codes[0]).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "UNEXPECTED");
}
