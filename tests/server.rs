//! HTTP API tests against a real server on a free port.

mod common;

use common::{find_free_port, wait_for_server, PromptLlm, TableEmbedder, CLOUD, EXPORT_CSV, EXPORT_PDF, OFFLINE};
use req_harness::config::Config;
use req_harness::embedding::{EmbeddingProvider, HashProvider};
use req_harness::llm::{DisabledLlm, LlmClient};
use req_harness::server::run_server_with_extensions;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

struct TestServer {
    base: String,
    _tmp: TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start(
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmClient>,
    api_key: Option<&str>,
) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let port = find_free_port();
    let mut cfg = Config::minimal();
    cfg.kb.base_dir = tmp.path().join("faiss_store");
    cfg.server.bind = format!("127.0.0.1:{}", port);
    cfg.server.api_key = api_key.map(str::to_string);

    let handle = tokio::spawn(async move {
        run_server_with_extensions(&cfg, embedder, llm).await.ok();
    });
    wait_for_server(port).await;

    TestServer {
        base: format!("http://127.0.0.1:{}", port),
        _tmp: tmp,
        handle,
    }
}

async fn kb_server() -> TestServer {
    start(Arc::new(HashProvider::new(64)), Arc::new(DisabledLlm), None).await
}

async fn poll_until_terminal(client: &reqwest::Client, url: &str) -> Value {
    for _ in 0..50 {
        let body: Value = client.get(url).send().await.unwrap().json().await.unwrap();
        let status = body["status"].as_str().unwrap_or_default().to_string();
        if status == "completed" || status == "failed" {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("job at {} did not finish", url);
}

#[tokio::test]
async fn health_reports_capabilities() {
    let server = kb_server().await;
    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["capabilities"]["embeddings"], true);
    assert_eq!(body["capabilities"]["llm"], false);
}

#[tokio::test]
async fn sync_build_query_status_and_incremental() {
    let server = kb_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/kb/build", server.base))
        .json(&json!({
            "project_id": 42,
            "mode": "sync",
            "documents": [
                {"content": "Users must log in with email", "type": "requirement"},
                {"content": "Exports run nightly at midnight"}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["total_chunks"], 2);

    let body: Value = client
        .post(format!("{}/kb/query", server.base))
        .json(&json!({"project_id": "42", "query": "log in with email", "top_k": 1}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total_results"], 1);
    assert_eq!(body["results"][0]["text"], "Users must log in with email");
    assert_eq!(body["results"][0]["meta"]["type"], "requirement");

    let body: Value = client
        .post(format!("{}/kb/incremental", server.base))
        .json(&json!({
            "project_id": 42,
            "documents": [
                {"content": "Users must log in with email"},
                {"content": "Passwords rotate every 90 days"}
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["added_chunks"], 1);
    assert_eq!(body["skipped_chunks"], 1);
    assert_eq!(body["total_chunks"], 3);
    assert_eq!(body["version"], 2);

    let body: Value = client
        .get(format!("{}/kb/status/42", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["exists"], true);
    assert_eq!(body["version"], 2);
    assert_eq!(body["total_chunks"], 3);
}

#[tokio::test]
async fn async_build_job_completes() {
    let server = kb_server().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/kb/build", server.base))
        .json(&json!({"project_id": "p1", "documents": [{"content": "alpha"}]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert!(job_id.starts_with("job_"));

    let job = poll_until_terminal(&client, &format!("{}/kb/job/{}", server.base, job_id)).await;
    assert_eq!(job["status"], "completed", "{}", job);
    assert_eq!(job["result"]["total_chunks"], 1);

    let resp = client
        .get(format!("{}/kb/job/job_unknown", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn error_contract() {
    let server = kb_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/kb/query", server.base))
        .json(&json!({"project_id": "ghost", "query": "anything"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/kb/incremental", server.base))
        .json(&json!({"project_id": "ghost", "documents": [{"content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/kb/build", server.base))
        .json(&json!({"project_id": "p", "documents": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/kb/build", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = client
        .get(format!("{}/kb/status/ghost", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["exists"], false);

    // Detection needs an LLM; this server has none.
    let resp = client
        .post(format!("{}/api/conflicts/detect", server.base))
        .json(&json!({"project_id": 1, "requirements": [{"id": "1", "text": "a"}, {"id": "2", "text": "b"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "dependency_unavailable");
}

#[tokio::test]
async fn needs_rag_returns_context() {
    let server = kb_server().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/kb/build", server.base))
        .json(&json!({"project_id": "p", "mode": "sync", "documents": [{"content": "Payment retries happen hourly"}]}))
        .send()
        .await
        .unwrap();

    let body: Value = client
        .post(format!("{}/kb/needs-rag", server.base))
        .json(&json!({"project_id": "p", "query": "How does payment work?"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["needs_rag"], true);
    assert!(body["context"]
        .as_str()
        .unwrap()
        .contains("Payment retries happen hourly"));

    let body: Value = client
        .post(format!("{}/kb/needs-rag", server.base))
        .json(&json!({"project_id": "other", "query": "hello"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["needs_rag"], false);
    assert!(body["context"].is_null());
}

#[tokio::test]
async fn api_key_guards_everything_but_health() {
    let server = start(
        Arc::new(HashProvider::new(64)),
        Arc::new(DisabledLlm),
        Some("s3cret"),
    )
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/kb/status/p", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");

    let resp = client
        .get(format!("{}/kb/status/p", server.base))
        .header("X-API-Key", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn conflict_job_lifecycle() {
    let llm = PromptLlm::new(
        &["1", "2"],
        r#"[{"req_a":"1","req_b":"2","reason":"offline vs cloud sync","confidence":"high"}]"#,
    );
    let server = start(Arc::new(TableEmbedder::two_pairs()), llm.clone(), None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/conflicts/detect", server.base))
        .json(&json!({
            "project_id": 17,
            "requirements": [
                {"id": 1, "text": OFFLINE},
                {"id": "2", "text": CLOUD},
                {"id": "3", "text": EXPORT_CSV},
                {"id": "4", "text": EXPORT_PDF}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert!(job_id.starts_with("17_"));

    let url = format!("{}/api/conflicts/status/{}", server.base, job_id);
    let job = poll_until_terminal(&client, &url).await;
    assert_eq!(job["status"], "completed", "{}", job);
    assert_eq!(job["metadata"]["clusters_found"], 2);
    assert_eq!(job["metadata"]["conflicts_found"], 1);
    let conflicts = job["conflicts"].as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["req_id_1"], "1");
    assert_eq!(conflicts[0]["req_id_2"], "2");
    assert_eq!(conflicts[0]["req_text_1"], OFFLINE);
    assert_eq!(conflicts[0]["severity"], "high");
    assert_eq!(llm.calls(), 2);

    let resp = client.delete(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = client.delete(&url).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn detect_rejects_bad_requests() {
    let llm = PromptLlm::new(&[], "[]");
    let server = start(Arc::new(TableEmbedder::two_pairs()), llm, None).await;
    let client = reqwest::Client::new();

    for body in [
        json!({"project_id": 1, "requirements": []}),
        json!({"project_id": 1, "requirements": [{"id": "1"}]}),
        json!({"project_id": 1, "requirements": [{"id": "1", "text": "a"}], "min_cluster_size": 1}),
    ] {
        let resp = client
            .post(format!("{}/api/conflicts/detect", server.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{}", body);
    }
}
