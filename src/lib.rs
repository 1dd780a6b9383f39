//! # tagline
//!
//! Batch AI image captioning and keyword tagging. Files are queued through a
//! rate-limit-aware Gemini pipeline and the generated caption and keywords are
//! embedded back into each image's own metadata (EXIF/IPTC for JPEG, `tEXt`
//! chunks for PNG, EXIF for WebP), with an optional `.txt` sidecar.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use tagline::ai::GeminiServiceFactory;
//! use tagline::config::SettingsStore;
//! use tagline::pipeline::{collect_images, Processor, WorkItem};
//! use tagline::queue::ProcessingQueue;
//! use tagline::status::StatusTracker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Encrypted settings (API keys, prompts, retry policy, ...)
//!     let store = SettingsStore::new("./".as_ref());
//!     let settings = Arc::new(store.load());
//!
//!     let tracker = StatusTracker::new();
//!     let processor = Arc::new(Processor::new(
//!         settings.clone(),
//!         Box::new(GeminiServiceFactory),
//!         tracker.clone(),
//!     ));
//!     let queue = ProcessingQueue::new(processor, tracker.clone(), settings.concurrency);
//!     queue.start();
//!
//!     for path in collect_images(&[PathBuf::from("./photos")]) {
//!         queue.enqueue(WorkItem::new(path, settings.selected_model.clone()));
//!     }
//!     queue.wait_for_idle().await;
//!
//!     for record in tracker.snapshot() {
//!         println!("{}: {}", record.path.display(), record.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Failure handling
//!
//! Each queued item runs an attempt cycle with three failure classes:
//! quota/rate-limit errors rotate to the next API credential without
//! consuming the retry budget (a full ring of rate limits halts the whole
//! queue), safety blocks fail the item immediately with the provider's
//! reason, and anything else retries up to the configured budget. A caption
//! that generated but failed to embed is surfaced as a partial failure, not
//! rolled back.
//!
//! ## Modules
//!
//! - [`ai`] — completion-service contract and the Gemini implementation
//! - [`config`] — settings schema, safety policy, encrypted persistence
//! - [`credentials`] — ordered API-key store with rotate-on-quota
//! - [`metadata`] — embedded-metadata codec (read with sentinels, format-aware write)
//! - [`pipeline`] — per-item retry/rotate state machine, image collection
//! - [`prompt`] — combined prompt builder and `CAPTION:`/`TAGS:` reply parser
//! - [`queue`] — FIFO queue with pause/stop/requeue and a background worker
//! - [`status`] — per-file status tracking and the observer event channel

pub mod ai;
pub mod config;
pub mod credentials;
pub mod metadata;
pub mod pipeline;
pub mod prompt;
pub mod queue;
pub mod status;
