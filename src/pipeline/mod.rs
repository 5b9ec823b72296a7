//! Pipeline Module
//!
//! Per-node connection management.
//!
//! ## Architecture
//! - One supervisor thread per node (connect, bootstrap, write, sweep)
//! - One reader thread per live connection (frame, correlate by opaque)
//! - Pending table shared between the two, guarded by a mutex

mod bootstrap;
mod pending;
#[allow(clippy::module_inception)]
mod pipeline;

pub use bootstrap::{
    bootstrap, hello_request, parse_hello_response, requested_features, sasl_plain_request,
    Capabilities,
};
pub use pending::{PendingTable, PipelineRequest, ResponseHandler};
pub(crate) use pipeline::on_io_thread;
pub use pipeline::{Pipeline, PipelineState};
