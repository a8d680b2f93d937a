//! MogileFS client library
//!
//! Pooled connections to the tracker tier, the line-oriented tracker
//! protocol, and streaming upload/download with replica failover against
//! storage nodes.

pub mod addr;
pub mod client;
pub mod codec;
pub mod download;
pub mod error;
pub mod pool;
pub mod storage;
pub mod tracker;
pub mod upload;

pub use addr::TrackerAddress;
pub use client::{ClientOptions, MogileFs, PooledMogile};
pub use download::FileReader;
pub use error::{Error, Result};
pub use upload::FileWriter;
