//! The block feed: `newHeads` subscription over JSON-RPC.

mod processor;
pub use processor::*;

mod service;
pub use service::*;

mod types;
pub use types::*;
