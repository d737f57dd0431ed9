//! Generation backend abstraction and candidate parsing.
//!
//! The pipeline treats generation as an opaque capability behind
//! [`GenerationBackend`]; adapters for an HTTP completion endpoint and for
//! canned replay responses are provided. [`parse_candidate`] resolves raw
//! backend text into an explicit sum type before any schema-aware code
//! touches it.

pub mod backend;
pub mod http;
pub mod parse;
pub mod replay;

pub use backend::{DynBackend, GenerationBackend, GenerationRequest, GenerationResponse};
pub use http::HttpBackend;
pub use parse::{parse_candidate, ParseRoute, Parsed};
pub use replay::ReplayBackend;
