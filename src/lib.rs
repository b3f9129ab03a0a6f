//! # entity-sync
//!
//! Hash-based entity synchronization: decide what changed since the last
//! run, turn changed records into embedded chunks, and commit them to every
//! destination before the metadata store records the new state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │ Sources  │──▶│ dedup → hash → classify  │──▶│  Dispatcher  │
//! │ FS/JSONL │   └──────────────────────────┘   └──────┬───────┘
//! └──────────┘                                         │
//!              ┌────────────────┬──────────────────────┼─────────────┐
//!              ▼                ▼                      ▼             ▼
//!        ┌──────────┐   ┌──────────────┐        ┌──────────┐  ┌───────────┐
//!        │  Vector  │   │ Self-process │        │ Raw data │  │ Metadata  │
//!        │ text→chunk│  │  text only   │        │ archive  │  │ (last)    │
//!        │ →embed   │   └──────────────┘        └──────────┘  └───────────┘
//!        └──────────┘
//! ```
//!
//! At the end of a run the [`orphans`] sweep removes everything stored for
//! the sync that the run never encountered.
//!
//! ## Quick Start
//!
//! ```bash
//! esync init                      # create database
//! esync sync filesystem           # sync a local directory
//! esync sync jsonl --progress json
//! esync stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entities, stored records, action batches |
//! | [`error`] | Typed error hierarchy |
//! | [`hashing`] | Deterministic content hashing |
//! | [`dedup`] | Within-run duplicate suppression |
//! | [`resolver`] | INSERT / UPDATE / KEEP / DELETE classification |
//! | [`extract`] | File-to-text converters |
//! | [`text`] | Textual representation builder |
//! | [`chunk`] | Text and code chunkers, chunk multiplication |
//! | [`embedding`] | Dense and sparse embedding providers |
//! | [`destination`] | Vector destinations and the raw archive |
//! | [`store`] | Metadata store |
//! | [`retry`] | Destination and deadlock retry policies |
//! | [`handlers`] | Per-destination action handlers |
//! | [`dispatch`] | Concurrent dispatch with metadata-last commit |
//! | [`orphans`] | End-of-run orphan sweep |
//! | [`ingest`] | Pipeline orchestration |
//! | [`sources`] | Filesystem and JSON-lines sources |
//! | [`progress`] | Counters and progress reporting |
//! | [`stats`] | `esync stats` |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod chunk;
pub mod config;
pub mod db;
pub mod dedup;
pub mod destination;
pub mod dispatch;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod hashing;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod orphans;
pub mod progress;
pub mod resolver;
pub mod retry;
pub mod sources;
pub mod stats;
pub mod store;
pub mod text;
