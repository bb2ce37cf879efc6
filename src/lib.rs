//! # Crawl Collector
//!
//! Resumable collection of one domain's captures from the Common Crawl
//! archive.
//!
//! Common Crawl exposes no query service, only flat, sorted, gzip-compressed
//! index files that can be read by HTTP byte range. The collector binary
//! searches those indexes for a list of domains (and their subdomains) and
//! downloads every matching WARC/ARC record, one request at a time, for as
//! long as it takes. Every step is persisted, so a multi-day run can be
//! stopped and restarted without repeating or losing work.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ ArchiveCatalog │──▶│ IndexSearch │──▶│  Collector   │
//! │  (snapshots)   │   │ cluster.idx │   │  one record  │
//! └────────────────┘   │  + shards   │   │  per cycle   │
//!                      └──────┬──────┘   └──┬────────┬──┘
//!                             │             │        │
//!                             ▼             ▼        ▼
//!                      ┌─────────────┐ ┌──────────┐ ┌─────────────┐
//!                      │ FetchClient │ │ Progress │ │ RetryLedger │
//!                      │ pacer+cache │ │  Store   │ │ (FIFO file) │
//!                      └─────────────┘ └──────────┘ └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! echo example.com > domains.conf
//! ccc archives                  # list crawl snapshots
//! ccc search example.com        # print matching index records
//! ccc run                       # collect everything, forever
//! ccc status example.com        # check progress
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and the domain list |
//! | [`domain`] | Domain validation and search keys |
//! | [`cdx`] | Cluster and shard index line formats |
//! | [`error`] | Error taxonomy |
//! | [`pacer`] | Rate limiting and backoff |
//! | [`fetch`] | Cached, paced HTTP access |
//! | [`storage`] | Atomic file writes |
//! | [`progress`] | Per-domain, per-archive progress |
//! | [`ledger`] | Retry ledger for failed downloads |
//! | [`archive`] | Snapshot manifest resolution |
//! | [`catalog`] | Snapshot discovery |
//! | [`search`] | Two-stage index search |
//! | [`collect`] | The collection driver |
//! | [`notify`] | Milestone notifications |
//! | [`status`] | Progress report |

pub mod archive;
pub mod catalog;
pub mod cdx;
pub mod collect;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod notify;
pub mod pacer;
pub mod progress;
pub mod search;
pub mod status;
pub mod storage;
