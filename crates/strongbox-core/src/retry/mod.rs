//! Retry execution engine with policy-based configuration
//!
//! Storage transfers run through this engine so that every backend shares
//! the same backoff schedule, logging and cancellation behaviour.
//!
//! # Features
//!
//! - Multiple retry strategies: None, Fixed, Exponential, Linear backoff
//! - Jittered delays so concurrent uploads don't retry in lockstep
//! - Observable retry attempts via the `RetryObserver` trait
//! - Cancellation through an [`AbortSignal`](crate::AbortSignal), also while
//!   sleeping between attempts
//!
//! # Example
//!
//! ```rust,no_run
//! use strongbox_core::retry::{RetryError, RetryExecutorBuilder, TransientOnly};
//! use strongbox_core::types::RetryPolicy;
//!
//! async fn example() -> Result<String, RetryError<strongbox_core::Error>> {
//!     RetryExecutorBuilder::new()
//!         .with_policy(RetryPolicy::default())
//!         .with_predicate(TransientOnly)
//!         .build()
//!         .execute(|| async { Ok("uploaded".to_string()) })
//!         .await
//! }
//! ```

mod error;
mod executor;
mod observer;
mod strategies;

pub use error::RetryError;
pub use executor::{RetryExecutor, RetryExecutorBuilder};
pub use observer::{NoOpObserver, RetryObserver, StatsObserver, TracingObserver};
pub use strategies::{calculate_delay, AlwaysRetry, RetryPredicate, TransientOnly};
