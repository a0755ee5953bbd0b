// SPDX-License-Identifier: MIT OR Apache-2.0

//! sigil is a client-side trust engine for content signing, modeled on The
//! Update Framework (TUF). A publisher stages target additions and removals
//! in a durable changelist, then publishes: the engine pulls the current
//! signed metadata from a remote server, verifies it against an X.509
//! trust anchor, replays the changelist, re-signs the affected roles with
//! locally held keys, and pushes the result back in a single round trip.
//! A consumer uses the same engine to pull, verify, and enumerate the
//! signed target set.
//!
//! The entry point is [`TrustRepository`], which owns the in-memory signed
//! metadata, the changelist, the key machinery, and the trust anchor store
//! for one globally unique name (GUN).

mod apply;
mod certs;
mod changelist;
mod client;
mod crypto;
mod error;
mod http;
mod keydb;
mod keystore;
mod repo;
mod repository;
pub mod schema;
mod sign;
mod store;
mod verify;

pub use crate::certs::CertManager;
pub use crate::changelist::{
    Change, ChangeAction, ChangeKind, Changelist, FileChangelist, MemChangelist, RootRoleChange,
    TufDelegation,
};
pub use crate::crypto::{CryptoService, KeyAlgorithm, PassphraseRetriever};
pub use crate::error::{Error, Result};
pub use crate::http::HttpStore;
pub use crate::keydb::KeyDb;
pub use crate::keystore::{FilesystemKeyStore, KeyStore, MemoryKeyStore};
pub use crate::repo::{default_expires, Repo};
pub use crate::repository::{Target, TargetWithRole, TrustRepository};
pub use crate::store::{FilesystemStore, MemoryStore, MetadataStore, RemoteStore};

/// The maximum size of a `root.json` we are willing to download when its
/// length is not yet pinned by other metadata.
pub const MAX_DOWNLOAD_SIZE: u64 = 5 << 20;
