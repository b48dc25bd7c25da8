//! HTTP surface of the relay: the upload page and the outpaint endpoint.

pub mod handlers;
