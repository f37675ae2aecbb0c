//! HTTP/1.x wire handling.
//!
//! - `request`: the parsed request record handed to the canonical encoder
//! - `parser`: incremental request framer over a raw byte buffer
//! - `response`: response serialization

pub mod parser;
pub mod request;
pub mod response;
