//! slap-core: asynchronous task coordination for the Slap client
//!
//! The client UI has two places where a delayed side effect must be
//! invalidated when a newer event supersedes it:
//!
//! ```text
//! keystroke ──► DebounceValidator ──► DelayedAction (500 ms) ──► availability check
//!                     ▲                                                │
//!                     └──────── identity check on resolution ◄─────────┘
//!
//! start() ──► AmbientScheduler ──► DelayedAction (2-6 s) ──► cycle ──► EffectPlayer
//!                     ▲                                        │
//!                     └──────────── next cycle ◄───────────────┘
//! ```
//!
//! # Modules
//!
//! - `delay`: Cancellable delayed actions on the tokio timer
//! - `random`: Random sources for trigger draws and jitter
//! - `validator`: Debounced, cancel-on-restart availability checks
//! - `ambient`: Self-rescheduling randomized effect triggers
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod ambient;
pub mod config;
pub mod delay;
pub mod error;
pub mod logging;
pub mod random;
pub mod validator;

pub use error::{Error, Result};
