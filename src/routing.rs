//! Host routing table
//!
//! Maps addresses to local references. Entries are keyed by the host portion
//! of an address (`<scheme>://<host>`), so `agent://billing/invoices` and
//! `agent://billing` resolve to the same agent.
//!
//! Lookups take a shared lock and may run concurrently from any number of
//! sending agents; registration and removal take the exclusive lock. A lookup
//! racing a removal may see either the old entry or none.

use crate::agent::AgentId;
use crate::error::{AgentError, Result};
use crate::reference::LocalRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Scheme used for peer node addresses
pub const NODE_SCHEME: &str = "http";

/// Extract `<scheme>://<host>` from `<scheme>://<host>[/<path>]`.
///
/// The host is lower-cased; the path, if any, is discarded.
pub fn host_address(address: &str) -> Result<String> {
    let malformed = || AgentError::MalformedAddress(address.to_string());

    let (scheme, rest) = address.split_once("://").ok_or_else(malformed)?;
    let valid_scheme = scheme
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid_scheme {
        return Err(malformed());
    }

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(malformed());
    }

    Ok(format!("{}://{}", scheme.to_ascii_lowercase(), host.to_ascii_lowercase()))
}

/// Address peers use to reach the node called `node_name`
pub fn node_address(node_name: &str) -> String {
    format!("{}://{}", NODE_SCHEME, node_name)
}

/// Address → local reference registry
#[derive(Default)]
pub struct HostRoutingTable {
    routes: RwLock<HashMap<String, LocalRef>>,
}

impl HostRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `address` to `target`.
    ///
    /// Fails if the host is already bound to a different agent that is still
    /// alive. An entry left behind by a dead agent is replaced.
    pub fn register(&self, address: &str, target: LocalRef) -> Result<()> {
        let host = host_address(address)?;
        let mut routes = self.routes.write();
        if let Some(existing) = routes.get(&host) {
            if existing.is_alive() && existing.id() != target.id() {
                return Err(AgentError::DuplicateRoute(host));
            }
        }
        debug!("Route {} -> {}", host, target.id());
        routes.insert(host, target);
        Ok(())
    }

    /// Look up the agent bound to the host portion of `address`.
    ///
    /// Never fails: a missing entry or a malformed address yields `None`.
    pub fn try_find(&self, address: &str) -> Option<LocalRef> {
        let host = host_address(address).ok()?;
        self.routes.read().get(&host).cloned()
    }

    /// Remove the entry for `address`, returning it if present
    pub fn remove(&self, address: &str) -> Option<LocalRef> {
        let host = host_address(address).ok()?;
        let removed = self.routes.write().remove(&host);
        if removed.is_some() {
            debug!("Route {} removed", host);
        }
        removed
    }

    /// Remove the entry for `address` only if it still points at `id`.
    pub(crate) fn remove_if(&self, address: &str, id: &AgentId) -> bool {
        let Ok(host) = host_address(address) else {
            return false;
        };
        let mut routes = self.routes.write();
        if routes.get(&host).is_some_and(|r| r.id() == id) {
            routes.remove(&host);
            debug!("Route {} released by {}", host, id);
            true
        } else {
            false
        }
    }

    /// Registered host addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.routes.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl std::fmt::Debug for HostRoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRoutingTable")
            .field("routes", &self.addresses())
            .finish()
    }
}
