//! Authenticated identity for connected apps.
//!
//! Verification itself lives behind the [`AuthenticationService`]
//! collaborator; this module only defines the principal shape the
//! admission pipeline enriches descriptors from, and the fixed mock
//! principal used when authentication is disabled.

use std::collections::BTreeSet;
use thiserror::Error;

/// Authentication method the broker passes to the verifier for setup
/// credentials.
pub const JWT_METHOD: &str = "JWT";

#[derive(Debug, Error)]
pub enum AuthError {
    /// The verification backend could not be reached. The transport
    /// retries via client reconnect; the registry never retries.
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

/// Authenticated identity attached to a live handler. Sets are ordered
/// so comma-joined enrichment values are deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub organizations: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub service_accounts: BTreeSet<String>,
    pub authorities: BTreeSet<String>,
}

impl Principal {
    /// Fixed principal synthesized when authentication is disabled.
    pub fn mock(app_name: &str) -> Self {
        Self {
            subject: app_name.to_string(),
            organizations: one("default"),
            roles: one("admin"),
            service_accounts: BTreeSet::new(),
            authorities: one("1"),
        }
    }

    pub fn joined_organizations(&self) -> String {
        join(&self.organizations)
    }

    pub fn joined_roles(&self) -> String {
        join(&self.roles)
    }

    pub fn joined_service_accounts(&self) -> String {
        join(&self.service_accounts)
    }
}

fn one(value: &str) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    set.insert(value.to_string());
    set
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Collaborator contract for credential verification.
///
/// The contract is synchronous; callers that must not block (the
/// admission path) dispatch through a blocking worker.
pub trait AuthenticationService: Send + Sync + 'static {
    /// Returns `None` when the credentials fail verification.
    fn auth(&self, method: &str, credentials: &str) -> Result<Option<Principal>, AuthError>;
}
