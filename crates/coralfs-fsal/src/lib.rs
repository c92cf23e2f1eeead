#![warn(missing_docs)]

//! CoralFS FSAL: exposes a CoralFS object-storage container through an
//! NFS server's virtual filesystem object-handle interface.
//!
//! The CoralFS client library has no file-descriptor concept and forbids
//! concurrent opens of a node. This crate arbitrates logical opens
//! through per-object share reservations, keeps wire-transmissible node
//! keys stable across client reconnects, and maps store errnos into the
//! server's error taxonomy. The server side of the contract (RPC
//! dispatch, protocol encoding, caching) and the store's internals are
//! external collaborators.

pub mod attr;
pub mod config;
pub mod error;
pub mod export;
pub mod handle;
pub mod mock;
pub mod session;
pub mod share;
pub mod store;
pub mod wire;
