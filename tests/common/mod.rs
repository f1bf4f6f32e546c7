#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use req_harness::embedding::EmbeddingProvider;
use req_harness::error::KbError;
use req_harness::llm::{Completion, CompletionRequest, LlmClient};
use std::collections::HashMap;
use std::sync::Arc;

pub const OFFLINE: &str = "The system must work fully offline";
pub const CLOUD: &str = "The system must sync data to the cloud in real time";
pub const EXPORT_CSV: &str = "Reports are exported as CSV";
pub const EXPORT_PDF: &str = "Reports are exported as PDF";

/// Fixed vectors per text. Unknown texts fail like a broken backend.
pub struct TableEmbedder {
    vectors: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    pub fn new(rows: &[(&str, [f32; 3])]) -> Self {
        Self {
            vectors: rows
                .iter()
                .map(|(t, v)| (t.to_string(), v.to_vec()))
                .collect(),
        }
    }

    /// Two tight pairs, far apart: offline/cloud and the two export rules.
    pub fn two_pairs() -> Self {
        Self::new(&[
            (OFFLINE, [1.0, 0.0, 0.0]),
            (CLOUD, [1.0, 0.5, 0.0]),
            (EXPORT_CSV, [0.0, 0.0, 1.0]),
            (EXPORT_PDF, [0.0, 0.5, 1.0]),
        ])
    }
}

#[async_trait]
impl EmbeddingProvider for TableEmbedder {
    fn model_name(&self) -> &str {
        "table"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|t| {
                self.vectors
                    .get(t)
                    .cloned()
                    .ok_or_else(|| KbError::Upstream(format!("no vector for {:?}", t)).into())
            })
            .collect()
    }
}

/// How a batch mentioning the failing id goes wrong.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// The backend call itself errors.
    Transport,
    /// The call succeeds but the answer holds no JSON.
    Prose,
}

/// Answers a batch with `answer` when its prompt mentions every id in
/// `when_ids`, otherwise with `[]`. Records prompts.
pub struct PromptLlm {
    when_ids: Vec<String>,
    answer: String,
    fail_on: Option<(String, Failure)>,
    pub prompts: Mutex<Vec<String>>,
}

impl PromptLlm {
    pub fn new(when_ids: &[&str], answer: &str) -> Arc<Self> {
        Arc::new(Self {
            when_ids: when_ids.iter().map(|s| s.to_string()).collect(),
            answer: answer.to_string(),
            fail_on: None,
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Like [`PromptLlm::new`], but any batch mentioning `fail_id` fails.
    pub fn failing_on(when_ids: &[&str], answer: &str, fail_id: &str, failure: Failure) -> Arc<Self> {
        Arc::new(Self {
            when_ids: when_ids.iter().map(|s| s.to_string()).collect(),
            answer: answer.to_string(),
            fail_on: Some((fail_id.to_string(), failure)),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl LlmClient for PromptLlm {
    fn model_name(&self) -> &str {
        "prompt-stub"
    }
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.prompts.lock().push(request.user.clone());
        if let Some((id, failure)) = &self.fail_on {
            if request.user.contains(&format!("[{}]", id)) {
                return match failure {
                    Failure::Transport => Err(KbError::Upstream("connection reset".into()).into()),
                    Failure::Prose => Ok(Completion {
                        text: "I could not find any conflicts worth reporting here.".into(),
                        tokens: 1,
                    }),
                };
            }
        }
        let hit = self
            .when_ids
            .iter()
            .all(|id| request.user.contains(&format!("[{}]", id)));
        let text = if hit { self.answer.clone() } else { "[]".to_string() };
        Ok(Completion { text, tokens: 1 })
    }
}

pub fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}
