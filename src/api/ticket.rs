use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::identity::Principal;

/// Time-to-live for a pending ticket.
const TICKET_TTL: Duration = Duration::from_secs(30);

/// Maximum number of pending (unconsumed) tickets.
const MAX_PENDING_TICKETS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("too many pending tickets")]
pub struct TicketLimitReached;

/// Short-lived, single-use tickets for WebSocket authentication.
///
/// Browser WebSocket connections cannot set an `Authorization` header, so an
/// operator first calls `POST /auth/ws-ticket` with their session token and
/// then opens the socket with `?ticket=<nonce>`. The ticket carries the
/// principal it was issued to; redeeming it yields that principal and removes
/// the ticket. Tickets expire after 30 seconds.
pub struct TicketStore {
    inner: Mutex<HashMap<String, (Instant, Principal)>>,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a ticket for `principal`.
    pub fn create(&self, principal: Principal) -> Result<String, TicketLimitReached> {
        let mut map = self.inner.lock();

        // Prune expired tickets first
        let now = Instant::now();
        map.retain(|_, (created, _)| now.duration_since(*created) < TICKET_TTL);

        if map.len() >= MAX_PENDING_TICKETS {
            return Err(TicketLimitReached);
        }

        let nonce: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        map.insert(nonce.clone(), (now, principal));
        Ok(nonce)
    }

    /// Consume a ticket, returning its principal if it existed and had not
    /// expired.
    pub fn redeem(&self, ticket: &str) -> Option<Principal> {
        let mut map = self.inner.lock();
        match map.remove(ticket) {
            Some((created, principal)) if Instant::now().duration_since(created) < TICKET_TTL => {
                Some(principal)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn tech() -> Principal {
        Principal {
            id: "op-1".into(),
            display_name: "Tech".into(),
            role: Role::Technician,
        }
    }

    #[test]
    fn redeem_returns_bound_principal_once() {
        let store = TicketStore::new();
        let ticket = store.create(tech()).unwrap();
        assert_eq!(ticket.len(), 32);
        assert_eq!(store.redeem(&ticket), Some(tech()));
        assert_eq!(store.redeem(&ticket), None);
    }

    #[test]
    fn unknown_ticket_rejected() {
        assert!(TicketStore::new().redeem("nonexistent").is_none());
    }

    #[test]
    fn limit_enforced() {
        let store = TicketStore::new();
        for _ in 0..MAX_PENDING_TICKETS {
            store.create(tech()).unwrap();
        }
        assert_eq!(store.create(tech()), Err(TicketLimitReached));
    }

    #[test]
    fn expired_tickets_rejected_and_pruned() {
        let store = TicketStore::new();
        store.inner.lock().insert(
            "old-ticket".to_string(),
            (Instant::now() - Duration::from_secs(60), tech()),
        );
        assert!(store.redeem("old-ticket").is_none());

        store.inner.lock().insert(
            "stale".to_string(),
            (Instant::now() - Duration::from_secs(60), tech()),
        );
        let fresh = store.create(tech()).unwrap();
        assert!(!store.inner.lock().contains_key("stale"));
        assert!(store.redeem(&fresh).is_some());
    }
}
