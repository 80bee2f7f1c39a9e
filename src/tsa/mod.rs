//! RFC 3161 time-stamping.
//!
//! [`TsaClient`] builds a `TimeStampReq` per attempt, posts it through a
//! [`TsaTransport`], and accepts the reply only when the authority granted
//! it and the token echoes the request's imprint and nonce.

mod client;
pub mod der;
pub mod mock;
mod request;
mod response;

pub use client::{
    HttpTransport, Timestamp, TsaClient, TsaTransport, QUERY_CONTENT_TYPE, REPLY_CONTENT_TYPE,
};
pub use request::{HashAlgorithm, TimeStampRequest};
pub use response::{TimeStampResponse, TstInfo};
