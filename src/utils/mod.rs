//! # Utility Modules
//!
//! Supporting utilities for fault counting, cryptography, logging, and timing.
//!
//! ## Components
//! - **Healed Counter**: Decaying instability counter with one-shot saturation
//! - **Crypto**: XChaCha20-Poly1305 AEAD encryption
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers and default durations
//! - **Metrics**: Thread-safe observability counters

pub mod crypto;
pub mod healed_counter;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use healed_counter::HealedCounter;
