//! Server-to-server federation for Souk marketplaces.
//!
//! Independently operated Souk servers establish pairwise trust through a
//! signed two-message handshake, after which each side keeps its own record
//! of the other with a trust level and a set of granted data scopes. Calls
//! between federated servers (user search, posting search, chat relay) are
//! signed over canonical strings and checked for freshness, trust and scope
//! before they are served.
//!
//! Everything here is synchronous and takes a `rusqlite::Connection`; the
//! HTTP server drives it from blocking tasks and performs the network legs
//! itself.
//!
//! Policy refusals come back as [`Verdict::Rejected`] values. [`FederationError`]
//! is reserved for missing configuration, storage failures and broken peers.

pub mod admin;
pub mod canonical;
pub mod directory;
pub mod handshake;
pub mod identity;
pub mod query;
pub mod relay;
pub mod trust;
pub mod types;
pub mod verifier;

mod error;

#[cfg(test)]
mod test_support;

pub use admin::{
    change_scopes, change_trust_level, issue_consent, remove_server, set_active, set_retention,
    AdminContext, CoSignature, Consent, ConsentSubject,
};
pub use directory::{
    ChatInbox, DirectoryUser, EmptyDirectory, InboundChatMessage, MarketplaceDirectory,
    MemoryInbox, StaticDirectory,
};
pub use error::FederationError;
pub use handshake::{accept_handshake, build_handshake_request, AcceptPolicy};
pub use identity::{
    get_public_identity, initialize, load_signing_identity, rotate_keys, IdentityHandle,
    InitializeParams, PublicIdentity, SigningIdentity,
};
pub use relay::{FederatedAddress, OutboundMessage};
pub use trust::{
    delete_federated_server, get_federated_server, get_federated_server_by_url,
    list_federated_servers, set_server_active, update_server_last_sync, update_server_retention,
    update_server_scopes, update_server_trust_level, upsert_federated_server, FederatedServer,
};
pub use verifier::{Rejection, RejectionReason, Verdict};

/// Path of the handshake endpoint on every federated server.
pub const HANDSHAKE_PATH: &str = "/federation/v1/handshake";
