//! HTTP surface and background sweeps.

pub mod client;
pub mod metrics;
pub mod processor;
pub mod responses;
pub mod routes;
pub mod server;
pub mod state;

pub use client::{Client, RemoteError};
pub use processor::{checkpoint_if_grown, run_processor, sweep, SweepReport};
pub use responses::{ApiError, ApiResponse};
pub use routes::{ConsistencyQuery, InclusionQuery, IngestRequest};
pub use server::{build_state, create_server, initialize_app_state, run_server, Backends};
pub use state::{AppState, ProcessorState, Schedule};
