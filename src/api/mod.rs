//! Remote I/O service protocol: client, transport pool, wire types.

mod client;
mod error;
mod pool;
pub mod types;

pub use client::{IoClient, ReadOutcome};
pub use error::{classify_response, RemoteErrno};
pub use pool::{ClientPool, HttpHandle, PoolGuard};
