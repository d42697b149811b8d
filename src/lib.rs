#![cfg_attr(not(test), warn(unused_crate_dependencies))]
use dotenv as _;

mod buffer;
pub use buffer::*;

mod cli;
pub use cli::*;

pub mod connection;

mod error;
pub use error::*;

pub mod blocks;
pub mod flashblocks;

mod metrics;
pub use metrics::*;

mod quantity;
pub use quantity::*;

mod rate_limit;
pub use rate_limit::*;

mod reporter;
pub use reporter::*;

pub mod rpc;

mod tracing;
pub use tracing::*;

mod tx_counts;
pub use tx_counts::*;
