//! Distributed trace propagation.
//!
//! Every outgoing request carries an `X-Trace-Id`: either the fixed id the
//! client was configured with, or a fresh random one per request.

use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "X-Trace-Id";
pub const TRACE_SAMPLED_HEADER: &str = "X-Trace-Sampled";

/// Random 128-bit trace id as 32 lowercase hex characters, no dashes.
pub fn gen_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}
