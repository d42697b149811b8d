//! The flashblock feed: partial block previews streamed as JSON or brotli-compressed JSON.

mod decode;
pub use decode::*;

mod primitives;
pub use primitives::*;

mod processor;
pub use processor::*;

mod service;
pub use service::*;
