//! `linedb` — an embedded, single-process key-value store that persists records as
//! newline-delimited JSON into a directory of append-only block files.
//!
//! Records are arbitrary `serde`-compatible values; reserved metadata (`id`, `_oid`, `_rid`,
//! `_seq`) is overlaid onto the same JSON object rather than wrapped around it. A single
//! [`Engine`] owns one directory: on [`Engine::open`] it replays every block to rebuild its
//! in-memory index, then serves `get`/`has` out of that index and durably appends `set`/`delete`
//! operations, compacting blocks in the background as they accumulate stale bytes.
//!
//! ```no_run
//! use linedb::{Engine, EngineConfigBuilder};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfigBuilder::new("./data").build()?;
//! let engine = Engine::open(config).await?;
//! engine.set("user:1", json!({ "name": "ferris" })).await?;
//! let record = engine.get::<serde_json::Value>("user:1")?;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)] // long-types happen, especially in async code
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

mod block;
mod codec;
mod config;
mod engine;
mod error;
mod index;
mod storage;

pub use codec::{Envelope, Oid, RecordId};
pub use config::{EngineConfig, EngineConfigBuilder, ErrorHook};
pub use engine::Engine;
pub use error::{BuildError, CodecError, EngineError, StorageError};
