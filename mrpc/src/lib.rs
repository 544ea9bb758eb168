//! mrpc: a small rpc framework over a plain TCP wire format.
//!
//! A server exposes services built with [`service`]; clients call them
//! directly by address ([`Client`]) or through a registry with load
//! balancing and broadcast ([`XClient`]).

pub use async_trait::async_trait;
pub use mrpc_derive::service;

pub use mrpc_client::*;
pub use mrpc_protocol::*;
pub use mrpc_registry::*;
pub use mrpc_server::*;
