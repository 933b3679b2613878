//! Pluggable principal resolution.
//!
//! `SWITCH_GFMD_CHANNEL` is only accepted from a peer already authenticated
//! as `AuthKind::MetadataHost`; any other kind gets `OperationNotPermitted`.
//! The cryptographic handshake that produces that classification is out of
//! scope here (descoped per the core's non-goals); this module only defines
//! the seam an external authentication layer plugs into, plus a trusting
//! implementation for local testing.

use gfmd_core::peer::AuthKind;

/// Resolves a raw connection's negotiated identity into an auth kind and a
/// principal name. Implementations that need the actual handshake bytes
/// should be constructed with whatever transport-level context they need;
/// this trait only describes the result.
pub trait AuthResolver: Send + Sync {
    /// `claimed_name` is whatever the peer asserted during connection setup
    /// (e.g. a hostname for a metadata-host peer, a username for an
    /// end-user peer). Implementations that perform real authentication
    /// ignore it in favor of a cryptographically verified identity.
    fn resolve(&self, claimed_kind: AuthKind, claimed_name: &str) -> (AuthKind, String);
}

/// Trusts the peer-supplied kind and name outright. Suitable for local
/// testing or deployments where transport-level trust (a private network)
/// stands in for authentication; production deployments should supply a
/// resolver backed by real credential verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthResolver;

impl AuthResolver for NullAuthResolver {
    fn resolve(&self, claimed_kind: AuthKind, claimed_name: &str) -> (AuthKind, String) {
        (claimed_kind, claimed_name.to_string())
    }
}

/// Check whether a peer's resolved auth kind may request
/// `SWITCH_GFMD_CHANNEL`.
#[must_use]
pub const fn permits_channel_switch(kind: AuthKind) -> bool {
    matches!(kind, AuthKind::MetadataHost)
}
