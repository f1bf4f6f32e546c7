//! End-to-end scenarios over the library API: KB build and dedup, detection
//! on small requirement sets, and missing-project errors.

mod common;

use common::{Failure, PromptLlm, TableEmbedder, CLOUD, EXPORT_CSV, EXPORT_PDF, OFFLINE};
use req_harness::config::Config;
use req_harness::conflict::{ConflictDetector, DetectionOptions, RunState};
use req_harness::embedding::HashProvider;
use req_harness::error::{classify, KbError};
use req_harness::kb::KnowledgeBase;
use req_harness::models::{Confidence, Document, RequirementInput};
use req_harness::progress::NoProgress;
use std::sync::Arc;
use tempfile::TempDir;

fn kb_in(tmp: &TempDir) -> KnowledgeBase {
    let mut config = Config::minimal();
    config.kb.base_dir = tmp.path().to_path_buf();
    KnowledgeBase::new(&config, Arc::new(HashProvider::new(64)))
}

fn doc(content: &str) -> Document {
    Document {
        content: content.to_string(),
        doc_type: None,
        meta: Default::default(),
    }
}

fn input(id: &str, text: &str) -> RequirementInput {
    RequirementInput {
        id: id.to_string(),
        text: text.to_string(),
    }
}

const CONFLICT_1_2: &str =
    r#"[{"req_a":"1","req_b":"2","reason":"offline vs real-time cloud sync","confidence":"high"}]"#;

#[tokio::test]
async fn build_then_duplicate_add_keeps_version() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_in(&tmp);

    let built = kb
        .build_project("7", vec![doc("Users must log in with email")])
        .await
        .unwrap();
    assert_eq!(built.version, 1);
    assert_eq!(built.total_chunks, 1);
    assert!(kb.project_status("7").exists);

    let upd = kb
        .incremental_update("7", vec![doc("Users must log in with email")])
        .await
        .unwrap();
    assert_eq!(upd.added_chunks, 0);
    assert_eq!(upd.skipped_chunks, 1);
    assert_eq!(upd.version, 1);

    let upd = kb
        .incremental_update("7", vec![doc("Sessions expire after 30 minutes")])
        .await
        .unwrap();
    assert_eq!((upd.added_chunks, upd.total_chunks, upd.version), (1, 2, 2));
}

#[tokio::test]
async fn clustered_pair_is_checked_in_one_batch() {
    let llm = PromptLlm::new(&["1", "2"], CONFLICT_1_2);
    let detector = ConflictDetector::new(
        Arc::new(TableEmbedder::two_pairs()),
        llm.clone(),
        DetectionOptions::default(),
    );
    let report = detector
        .run(
            vec![
                input("1", OFFLINE),
                input("2", CLOUD),
                input("3", EXPORT_CSV),
                input("4", EXPORT_PDF),
            ],
            &NoProgress,
        )
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.metadata.clusters_found, 2);
    assert_eq!(report.metadata.noise_points, 0);
    // One call per cluster, each covering both members.
    assert_eq!(llm.calls(), 2);
    let offline_prompts: Vec<String> = llm
        .prompts
        .lock()
        .iter()
        .filter(|p| p.contains("[1]"))
        .cloned()
        .collect();
    assert_eq!(offline_prompts.len(), 1);
    assert!(offline_prompts[0].contains("[2]"));

    assert_eq!(report.conflicts.len(), 1);
    let c = &report.conflicts[0];
    assert_eq!(c.req_a_id, "1");
    assert_eq!(c.req_b_id, "2");
    assert_eq!(c.req_a_text, OFFLINE);
    assert_eq!(c.req_b_text, CLOUD);
    assert_eq!(c.confidence, Confidence::High);
    assert_eq!(report.metadata.conflicts_found, 1);
}

#[tokio::test]
async fn lone_pair_is_noise_and_never_sent() {
    let llm = PromptLlm::new(&["1", "2"], CONFLICT_1_2);
    let detector = ConflictDetector::new(
        Arc::new(TableEmbedder::two_pairs()),
        llm.clone(),
        DetectionOptions::default(),
    );
    let report = detector
        .run(vec![input("1", OFFLINE), input("2", CLOUD)], &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.metadata.clusters_found, 0);
    assert_eq!(report.metadata.noise_points, 2);
    assert_eq!(llm.calls(), 0);
    assert!(report.conflicts.is_empty());
}

#[tokio::test]
async fn single_requirement_completes_without_calls() {
    let llm = PromptLlm::new(&[], "[]");
    let detector = ConflictDetector::new(
        Arc::new(TableEmbedder::two_pairs()),
        llm.clone(),
        DetectionOptions::default(),
    );
    let report = detector
        .run(vec![input("1", OFFLINE)], &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(report.conflicts.is_empty());
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn near_duplicates_are_pruned_before_checking() {
    let embedder = TableEmbedder::new(&[
        (OFFLINE, [1.0, 0.0, 0.0]),
        (CLOUD, [1.0, 0.01, 0.0]),
        (EXPORT_CSV, [0.0, 0.0, 1.0]),
        (EXPORT_PDF, [0.0, 0.5, 1.0]),
    ]);
    let llm = PromptLlm::new(&["1", "2"], CONFLICT_1_2);
    let detector =
        ConflictDetector::new(Arc::new(embedder), llm.clone(), DetectionOptions::default());
    let report = detector
        .run(
            vec![
                input("1", OFFLINE),
                input("2", CLOUD),
                input("3", EXPORT_CSV),
                input("4", EXPORT_PDF),
            ],
            &NoProgress,
        )
        .await
        .unwrap();
    // The offline cluster collapses to one member and is skipped.
    assert_eq!(llm.calls(), 1);
    assert!(!llm.prompts.lock()[0].contains("[1]"));
    assert!(report.conflicts.is_empty());
}

const AUTH: [&str; 5] = [
    "Users sign in with a password",
    "Users sign in with a hardware key",
    "Users sign in with a one-time code",
    "Users sign in through corporate SSO",
    "Users sign in with a magic link",
];
const AUDIT_LOCAL: &str = "Audit logs stay on the local disk";
const AUDIT_REMOTE: &str = "Audit logs ship to a remote collector";

/// Five sign-in rules fanned around one axis at distinct angles (all pairs
/// below the near-duplicate threshold) plus a distant audit pair, so the
/// sign-in rules form a single cluster of five.
fn fanned_embedder() -> TableEmbedder {
    TableEmbedder::new(&[
        (AUTH[0], [1.0, 0.0, 0.0]),
        (AUTH[1], [0.9063, 0.4226, 0.0]),
        (AUTH[2], [0.8829, 0.0, 0.4695]),
        (AUTH[3], [0.8572, -0.5150, 0.0]),
        (AUTH[4], [0.8290, 0.0, -0.5592]),
        (AUDIT_LOCAL, [-1.0, 0.0, 0.0]),
        (AUDIT_REMOTE, [-0.9063, 0.0, 0.4226]),
    ])
}

fn fanned_inputs() -> Vec<RequirementInput> {
    let mut inputs: Vec<RequirementInput> = AUTH
        .iter()
        .enumerate()
        .map(|(i, text)| input(&(i + 1).to_string(), text))
        .collect();
    inputs.push(input("6", AUDIT_LOCAL));
    inputs.push(input("7", AUDIT_REMOTE));
    inputs
}

#[tokio::test]
async fn large_cluster_is_split_into_ordered_batches() {
    let llm = PromptLlm::new(&[], "[]");
    let options = DetectionOptions {
        max_cluster_batch: 2,
        ..DetectionOptions::default()
    };
    let detector = ConflictDetector::new(Arc::new(fanned_embedder()), llm.clone(), options);
    let report = detector.run(fanned_inputs(), &NoProgress).await.unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.metadata.clusters_found, 2);
    assert_eq!(report.metadata.noise_points, 0);
    // Sign-in cluster: [1,2] and [3,4]; the trailing [5] is never sent.
    // Audit cluster: [6,7].
    assert_eq!(report.llm_calls, 3);
    assert_eq!(llm.calls(), 3);

    let prompts = llm.prompts.lock().clone();
    let auth: Vec<&String> = prompts.iter().filter(|p| p.contains("sign in")).collect();
    assert_eq!(auth.len(), 2);
    assert!(auth[0].contains("[1]") && auth[0].contains("[2]"));
    assert!(!auth[0].contains("[3]"));
    assert!(auth[1].contains("[3]") && auth[1].contains("[4]"));
    assert!(!auth[1].contains("[1]"));
    assert!(prompts.iter().all(|p| !p.contains("[5]")));
    assert!(prompts.iter().any(|p| p.contains("[6]") && p.contains("[7]")));
}

#[tokio::test]
async fn failed_batch_is_counted_and_others_still_aggregate() {
    for failure in [Failure::Transport, Failure::Prose] {
        let llm = PromptLlm::failing_on(&["1", "2"], CONFLICT_1_2, "3", failure);
        let detector = ConflictDetector::new(
            Arc::new(TableEmbedder::two_pairs()),
            llm.clone(),
            DetectionOptions::default(),
        );
        let report = detector
            .run(
                vec![
                    input("1", OFFLINE),
                    input("2", CLOUD),
                    input("3", EXPORT_CSV),
                    input("4", EXPORT_PDF),
                ],
                &NoProgress,
            )
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Completed, "{:?}", failure);
        assert_eq!(report.llm_calls, 2, "{:?}", failure);
        assert_eq!(report.failed_batches, 1, "{:?}", failure);
        assert_eq!(report.conflicts.len(), 1, "{:?}", failure);
        assert_eq!(report.conflicts[0].req_a_id, "1");
        assert_eq!(report.metadata.conflicts_found, 1);
    }
}

#[tokio::test]
async fn missing_project_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_in(&tmp);
    let err = kb
        .query_project("does-not-exist", "anything", None)
        .await
        .unwrap_err();
    assert!(matches!(classify(&err), Some(KbError::NotFound(_))));
    assert!(!kb.project_status("does-not-exist").exists);
}
