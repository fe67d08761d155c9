//! A topology-aware MongoDB operation dispatcher: Server Discovery and Monitoring, server
//! selection, and retryable read/write dispatch, independent of any particular wire-protocol codec
//! or CRUD surface (spec §1).
//!
//! The pieces this crate deliberately leaves to a caller (spec §1 "Out of scope"): connection
//! string parsing beyond what [`client::options::ClientOptions::parse`] already covers, BSON
//! encoding/decoding of command bodies, wire-protocol framing and authentication (the [`Link`]/
//! [`LinkFactory`] seam), and any high-level CRUD surface (collections, cursors, change streams).

pub mod address;
pub mod client;
pub mod concern;
pub mod dispatcher;
pub mod error;
pub mod event;
mod link;
pub mod operation;
pub mod sdam;
pub mod selection_criteria;

pub use address::ServerAddress;
pub use client::{Client, ClientSession, TransactionOptions};
pub use dispatcher::Dispatcher;
pub use error::{Error, ErrorKind, Result};
pub use link::{BoxFuture, Link, LinkCapabilities, LinkFactory, Transport};
pub use operation::{CommandResult, Operation};
