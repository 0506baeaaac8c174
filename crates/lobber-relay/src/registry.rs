//! Hostname registry for live tunnel sessions
//!
//! At most one session is reachable per hostname. Registering a hostname
//! that already has a session replaces it (latest wins); the ejected session
//! is closed after its cleanup hook is detached, so its close cannot
//! unregister the replacement.

use crate::session::TunnelSession;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Registry mapping hostname -> live tunnel session.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<TunnelSession>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session under its hostname, replacing and closing any
    /// session already registered there.
    pub fn register(&self, session: Arc<TunnelSession>) {
        let domain = session.domain().to_string();
        let replaced = {
            let mut tunnels = self.tunnels.write().unwrap();
            tunnels.insert(domain.clone(), session)
        };

        match replaced {
            Some(old) => {
                // Detach first: the old session's close must not remove the
                // entry we just installed.
                old.detach_on_close();
                old.close();
                info!(%domain, "replaced existing tunnel session");
            }
            None => {
                info!(%domain, "registered tunnel session");
            }
        }
    }

    /// Remove the entry for a hostname, whichever session owns it.
    pub fn unregister(&self, domain: &str) -> Option<Arc<TunnelSession>> {
        let removed = self.tunnels.write().unwrap().remove(domain);
        if removed.is_some() {
            info!(%domain, "unregistered tunnel session");
        } else {
            warn!(%domain, "attempted to unregister unknown tunnel");
        }
        removed
    }

    /// Remove the entry for this exact session. Called by each session's
    /// on-close hook: the entry is removed only if it still holds the
    /// closing session, so a stale cleanup racing a replacement can never
    /// delete the newer entry.
    pub fn unregister_session(&self, session: &TunnelSession) -> bool {
        let domain = session.domain();
        let mut tunnels = self.tunnels.write().unwrap();
        let owns_entry = tunnels
            .get(domain)
            .is_some_and(|stored| std::ptr::eq(Arc::as_ptr(stored), session));
        if owns_entry {
            tunnels.remove(domain);
            info!(%domain, "unregistered tunnel session");
        } else {
            debug!(%domain, "skipping unregister, session was superseded");
        }
        owns_entry
    }

    pub fn lookup(&self, domain: &str) -> Option<Arc<TunnelSession>> {
        self.tunnels.read().unwrap().get(domain).cloned()
    }

    pub fn has(&self, domain: &str) -> bool {
        self.tunnels.read().unwrap().contains_key(domain)
    }

    pub fn count(&self) -> usize {
        self.tunnels.read().unwrap().len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
