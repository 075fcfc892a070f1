//! Pipeline stages for page-by-page conversion.
//!
//! Each submodule implements exactly one transformation step. Keeping
//! stages separate makes each independently testable and lets us swap
//! implementations (e.g. a different recognition backend) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ cache? ──▶ recognize ──▶ clean ──▶ classify ──▶ cache write
//! (page files) (hit =     (remote,      (regex     (type tag +   (atomic)
//!               done)      skipped for   cleanup)   formatting)
//!                          text-layer
//!                          pages)
//! ```
//!
//! 1. [`extract`]   — supply one page's raw content (image bytes plus the
//!    embedded text layer when the source has one)
//! 2. [`recognize`] — drive the remote vision-OCR call with
//!    retry/backoff/timeout; the only stage with network I/O
//! 3. [`clean`]     — deterministic text-cleanup rules applied before
//!    formatting
//! 4. [`classify`]  — assign a page type and produce formatted output
//! 5. [`stage`]     — glue the steps together behind the page cache with a
//!    per-fingerprint single-flight guard

pub mod classify;
pub mod clean;
pub mod extract;
pub mod recognize;
pub mod stage;
