//! # passline
//!
//! A resumable multi-pass analysis pipeline for source artifacts.
//!
//! passline keeps one record per source artifact, runs an ordered list of
//! named analysis passes over each record, persists every pass result, and
//! derives numeric quality scores from a designated scoring pass. Each pass
//! delegates to a backend: an AI completion API or a static analysis tool.
//!
//! A record carries the list of passes it has completed, so a batch run can
//! stop at any point and be resumed without repeating work.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Ingest  │──▶│ ArtifactStore│◀──│ BatchRunner │──▶│ Progress │
//! │ FS scan  │   │   (SQLite)   │   │ (N workers) │   └──────────┘
//! └──────────┘   └──────▲───────┘   └──────┬──────┘
//!                       │                  ▼
//!                ┌──────┴───────┐   ┌─────────────┐   ┌──────────┐
//!                │    Scores    │◀──│ PassExecutor│──▶│ Backends │
//!                └──────────────┘   └──────┬──────┘   │ AI / tool│
//!                                          ▼          └──────────┘
//!                                   ┌─────────────┐
//!                                   │PassRegistry │
//!                                   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! passline init                  # create database
//! passline ingest                # scan sources into records
//! passline passes                # check the pipeline
//! passline run --concurrency 4   # run missing passes
//! passline status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors for registry, store, backends, scoring |
//! | [`models`] | Core data types |
//! | [`registry`] | Pass catalog and global order |
//! | [`store`] | Record and result persistence (SQLite, in-memory) |
//! | [`backend`] | AI and static-tool backends |
//! | [`executor`] | Per-record pass state machine |
//! | [`runner`] | Batch execution with bounded concurrency |
//! | [`scores`] | Metric extraction from the scoring pass |
//! | [`ingest`] | Filesystem scan into records |
//! | [`progress`] | Run progress on stderr |
//! | [`status`] | Pipeline overview |
//! | [`show`] | Record detail and removal |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod scores;
pub mod show;
pub mod status;
pub mod store;
