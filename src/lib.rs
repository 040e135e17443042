//! This crate contains the client-side execution core of the FerroDB Rust
//! driver: the layer that takes a logical operation and turns it into one
//! correctly-sequenced network round trip, transparently handling session
//! binding, server selection, and retry-on-failure.
//!
//! The entry point is [`Client`], which is cheap to clone and can be shared
//! freely across async tasks:
//!
//! ```no_run
//! # async fn run() -> ferrodb::error::Result<()> {
//! use ferrodb::{options::ClientOptions, Client};
//!
//! let options = ClientOptions::builder()
//!     .hosts(vec!["db1.example.com:27017".parse()?])
//!     .build();
//! let client = Client::with_options(options)?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The crate emits structured [`tracing`] events but never installs a
//! subscriber; applications choose their own.

#![warn(missing_docs)]

pub use ::bson;

mod client;
mod cmap;
pub mod error;
mod linked_list;
mod namespace;
pub mod options;
mod operation;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod state_transitions;

pub use crate::{
    client::{csfle::CryptProvider, session::ClientSession, Client},
    namespace::Namespace,
    sdam::public::{ServerInfo, ServerType},
    selection_criteria::{Predicate, ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};
