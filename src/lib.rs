//! # Bizcard Pipeline
//!
//! An event-driven pipeline that turns uploaded business-card images into
//! structured records and a searchable, cached index.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Upload API │──▶│ Object store │──▶│ Upload watcher│──▶│ bizcard-image│
//! └────────────┘   └──────────────┘   └───────────────┘   └──────┬───────┘
//!                                                                 ▼
//!                  ┌──────────────┐   ┌──────────────────────────────────┐
//!                  │ Keyed store  │◀──│ Extraction worker (OCR + fields) │
//!                  └──────────────┘   └────────────────┬─────────────────┘
//!                                                      ▼
//!                                               ┌──────────────┐
//!                                  ┌────────────│ bizcard-text │────────────┐
//!                                  ▼            └──────────────┘            ▼
//!                         ┌─────────────────┐                      ┌───────────────┐
//!                         │ Indexing worker │                      │ Archival sink │
//!                         └────────┬────────┘                      └───────────────┘
//!                                  ▼
//!                     ┌──────────────────────────┐
//!                     │ Search index + query cache│
//!                     └──────────────────────────┘
//! ```
//!
//! Streams are ordered per partition and checkpointed per consumer group, so
//! every stage resumes where it left off and redelivery converges through
//! upserts keyed by [`models::ImageId`].
//!
//! ## Quick Start
//!
//! ```bash
//! bizcard init                       # create database
//! bizcard serve                      # upload API + all workers
//! bizcard put ./cards/jane.jpg       # enqueue a local image
//! bizcard search "acme engineer"
//! bizcard status                     # checkpoints and lag
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Transient / permanent / fatal error taxonomy |
//! | [`retry`] | Timeouts and exponential backoff |
//! | [`object_store`] | Filesystem, S3 and in-memory object storage |
//! | [`signing`] | SigV4 and upload API request signatures |
//! | [`stream`] | Partitioned streams, checkpoints, batch consumers |
//! | [`store`] | Keyed store, search index, dead letters |
//! | [`watcher`] | Object-created notifications → work items |
//! | [`ocr`] | OCR provider abstraction |
//! | [`card_fields`] | OCR lines → business-card fields |
//! | [`extract_worker`] | Work items → records + text events |
//! | [`index_worker`] | Text events → search index |
//! | [`archive`] | Text events → compressed archive objects |
//! | [`cache`] | Query cache in front of the index |
//! | [`search`] | Cached search service and CLI search |
//! | [`server`] | Upload API (axum) |
//! | [`pipeline`] | Wiring, lifecycle, `serve` and `put` |
//! | [`status`] | Checkpoint/lag report and dead-letter listing |
//! | [`get`] | Record lookup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod archive;
pub mod cache;
pub mod card_fields;
pub mod config;
pub mod db;
pub mod error;
pub mod extract_worker;
pub mod get;
pub mod index_worker;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod ocr;
pub mod pipeline;
pub mod retry;
pub mod search;
pub mod server;
pub mod signing;
pub mod status;
pub mod store;
pub mod stream;
pub mod watcher;
