//! Core types and traits for the revdb record/replay engine.
//!
//! This crate is the leaf dependency shared by the log codec and the
//! engine. It defines the strongly-typed identifiers ([`Uid`],
//! [`ThreadIdent`]) and the capability traits a host runtime implements
//! so the engine can name its objects ([`ObjectIdentity`]) and track
//! weak references to them ([`HostObject`], [`WeakHandle`]).

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod id;
pub mod traits;

pub use id::{ThreadIdent, Uid};
pub use traits::{HostObject, ObjectIdentity, WeakHandle};
