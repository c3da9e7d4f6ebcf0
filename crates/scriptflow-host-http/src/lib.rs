//! HTTP capability for sandboxed flow scripts.
//!
//! [`HttpShim`] is the only network primitive a flow script can reach. It
//! wraps a `reqwest` client behind an [`HttpPolicy`]: per-call timeout and
//! response size caps, a per-invocation request quota, a scheme allow-list
//! and a host deny-list (also applied to redirects). Non-2xx responses are
//! errors unless the caller opts out.

mod client;
mod error;
mod policy;

pub use client::{HttpResponse, HttpShim, RequestBody, RequestOptions};
pub use error::HttpError;
pub use policy::HttpPolicy;
