//! # Requirements Harness
//!
//! Per-project semantic knowledge bases plus cluster-scoped conflict
//! detection for software requirements.
//!
//! A knowledge base is a flat inner-product vector index over L2-normalized
//! embeddings, stored next to a versioned metadata envelope. Conflict
//! detection embeds a requirement set, clusters it with HDBSCAN, and asks a
//! chat model to find contradictions inside each cluster only.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌───────────────────┐
//! │ Documents  │──▶│  Embedding  │──▶│ faiss_index.bin + │
//! │ (JSON)     │   │  Provider   │   │ faiss_meta.pkl    │
//! └────────────┘   └──────┬──────┘   └─────────┬─────────┘
//!                         │                    │
//! ┌────────────┐   ┌──────▼──────┐   ┌─────────▼─────────┐
//! │Requirements│──▶│  HDBSCAN +  │──▶│ LLM batch checks  │
//! │            │   │  reassign   │   │ + response salvage│
//! └────────────┘   └─────────────┘   └───────────────────┘
//!                      CLI (reqh)  /  HTTP (axum)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! reqh kb build 42 docs.json
//! reqh kb query 42 "password rotation"
//! reqh detect requirements.txt --out ./out
//! reqh serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed error taxonomy |
//! | [`models`] | Core data types |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Flat inner-product vector index and atomic writes |
//! | [`store`] | Project KB persistence, dedup and incremental add |
//! | [`locks`] | Per-project write serialization |
//! | [`kb`] | Project-level KB operations and retrieval gating |
//! | [`cluster`] | HDBSCAN, noise reassignment, near-duplicate pruning |
//! | [`llm`] | Chat-completion client abstraction |
//! | [`response`] | Lenient parsing of model output |
//! | [`conflict`] | Conflict-detection pipeline and export |
//! | [`progress`] | Detection progress reporting |
//! | [`jobs`] | Background job tracking |
//! | [`server`] | HTTP API |

pub mod cluster;
pub mod config;
pub mod conflict;
pub mod detect_cmd;
pub mod embedding;
pub mod error;
pub mod index;
pub mod jobs;
pub mod kb;
pub mod kb_cmd;
pub mod llm;
pub mod locks;
pub mod models;
pub mod progress;
pub mod response;
pub mod server;
pub mod store;
