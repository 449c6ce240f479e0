//! Retrying document opens for Rampart.
//!
//! Opening a player's record goes through a slow, rate-limited backend
//! that fails now and then. This crate decides what to do about each
//! failure and loops until the open succeeds or the policy gives up:
//!
//! ```text
//! open_with_retry()
//!   loop:
//!     store.get_document() ──ok──→ return (document, created)
//!         │ err
//!         ▼
//!     classify() ──→ RetryPolicy::decide() ──RetryAfter(d)──→ sleep(d + jitter)
//!                                        └──Fail(reason)───→ return OpenFailure
//! ```
//!
//! [`RetryPolicy::decide`] is pure: it never sleeps or touches the store,
//! so the backoff schedule can be tested without a runtime.
//! [`OpenFailure`] is the only failure taxonomy the session layer sees.

mod config;
mod failure;
mod open;
mod policy;

pub use config::RetryConfig;
pub use failure::OpenFailure;
pub use open::open_with_retry;
pub use policy::{Decision, FailReason, FailureClass, RetryPolicy, classify};
