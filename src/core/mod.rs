//! # Core Protocol Components
//!
//! Value types and the frame codec every layer builds on.
//!
//! ## Components
//! - **EndPoint**: Peer identity (host + port)
//! - **Message**: Outgoing payloads, framed headers and identifier allocation
//! - **Codec**: Tokio codec for framing headers over byte streams
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Identifier(8)] [RequestId(8)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB by default (prevents memory exhaustion)
//! - Magic bytes prevent accidental misinterpretation
//! - Length validation before allocation

pub mod codec;
pub mod endpoint;
pub mod message;
