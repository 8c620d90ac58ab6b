//! Client-side JSON-RPC 2.0 messaging core for language servers.
//!
//! Spawns a server subprocess, frames messages over its stdio, correlates
//! requests with responses, and dispatches inbound requests and
//! notifications to ordered handler lists. Method-based routing and LSP
//! semantics live above this crate (see `tether-client`).

pub mod codec;
pub mod message;

mod client;
mod error;

pub use client::{NotifyHandler, RequestHandler, RpcClient};
pub use error::Error;
pub use message::{
    Incoming, NotificationMessage, RequestMessage, ResponseError, ResponseMessage, classify,
};
