//! HTTP/1.x message framing.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → framed.rs (buffer, find head boundary, walk body framing)
//!     → head.rs (httparse into RequestHead / ResponseHead)
//!     → consumed bytes mirrored to the transform stage
//! ```
//!
//! # Design Decisions
//! - Heads are parsed for decisions only; what reaches the peer is the raw
//!   byte stream after transforms, never a re-serialized head
//! - Body framing is tracked so transaction boundaries are exact on
//!   keep-alive and pipelined connections

pub mod framed;
pub mod head;

pub use framed::FramedReader;
pub use head::{BodyFraming, RequestHead, ResponseHead};
