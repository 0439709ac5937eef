//! # ragdock
//!
//! Retrieval-augmented answering over project documents, backed by a
//! pluggable vector store and an idempotent job layer.
//!
//! ## Architecture
//!
//! ```text
//!   files ──▶ chunk ──▶ SQLite (projects, assets, chunks, ledger)
//!                              │
//!                 ┌────────────┴─────────────┐
//!                 ▼                          ▼
//!        IndexingOrchestrator       RetrievalAnswerer ──▶ Generator
//!                 │    ▲                     │               │ (fails?)
//!                 ▼    │ Embedder            ▼               ▼
//!            VectorStore (embedded | pgvector)          extractive summary
//!
//!   JobRunner ──▶ IdempotencyLedger ──▶ jobs::tasks (process / index / workflow / cleanup)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragdock init
//! ragdock workflow 1            # chunk ./data/files/1/*.md and index them
//! ragdock answer 1 "How do I deploy?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and user-visible signals |
//! | [`models`] | Core data types |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`repository`] | Projects, assets, and chunks |
//! | [`chunk`] | Text chunking |
//! | [`namer`] | Collection naming |
//! | [`store`] | Vector store contract and backends |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Generation provider abstraction |
//! | [`templates`] | Prompt templates |
//! | [`indexing`] | Chunk → vector store orchestration |
//! | [`retrieval`] | Search and RAG answering |
//! | [`summary`] | Extractive fallback summarizer |
//! | [`ledger`] | Job idempotency ledger |
//! | [`jobs`] | Job runner and job bodies |
//! | [`progress`] | Job state observers |
//! | [`app`] | Component wiring |

pub mod app;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod indexing;
pub mod jobs;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod namer;
pub mod progress;
pub mod repository;
pub mod retrieval;
pub mod store;
pub mod summary;
pub mod templates;
