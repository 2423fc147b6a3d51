use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const TICKET_TTL: Duration = Duration::from_secs(120);
const TICKET_ID_LEN: usize = 16;

/// A single-use credential delegating an existing session to one follow-up
/// request from the same address.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub user: String,
    pub token: String,
    pub origin: IpAddr,
    issued: Instant,
}

#[derive(Clone, Default)]
pub struct TicketStore {
    tickets: Arc<Mutex<HashMap<String, Ticket>>>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a ticket and schedules its unconditional expiry. Must be called
    /// from within a tokio runtime.
    pub fn issue(&self, user: &str, token: &str, origin: IpAddr) -> String {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TICKET_ID_LEN)
            .map(char::from)
            .collect();
        let ticket = Ticket {
            user: user.to_string(),
            token: token.to_string(),
            origin,
            issued: Instant::now(),
        };
        self.tickets.lock().insert(id.clone(), ticket);
        debug!(user = %user, origin = %origin, "Issued ticket");

        let tickets = self.tickets.clone();
        let expiring_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICKET_TTL).await;
            tickets.lock().remove(&expiring_id);
        });
        id
    }

    /// Load-and-delete: a ticket is gone after the first attempt, whether or not
    /// that attempt came from the right address.
    pub fn consume(&self, id: &str, origin: IpAddr) -> Option<Ticket> {
        let ticket = self.tickets.lock().remove(id)?;
        if ticket.origin != origin {
            debug!(user = %ticket.user, expected = %ticket.origin, actual = %origin, "Ticket used from another address");
            return None;
        }
        if ticket.issued.elapsed() > TICKET_TTL {
            return None;
        }
        Some(ticket)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn ticket_is_single_use() {
        let store = TicketStore::new();
        let id = store.issue("alice", "tok", ip(1));
        let ticket = store.consume(&id, ip(1)).expect("first use succeeds");
        assert_eq!(ticket.user, "alice");
        assert_eq!(ticket.token, "tok");
        assert!(store.consume(&id, ip(1)).is_none());
    }

    #[tokio::test]
    async fn ticket_is_bound_to_origin() {
        let store = TicketStore::new();
        let id = store.issue("alice", "tok", ip(1));
        assert!(store.consume(&id, ip(2)).is_none());
        // Burned by the failed attempt.
        assert!(store.consume(&id, ip(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_expires_after_two_minutes() {
        let store = TicketStore::new();
        let id = store.issue("alice", "tok", ip(1));
        tokio::time::sleep(TICKET_TTL + Duration::from_secs(1)).await;
        assert_eq!(store.len(), 0);
        assert!(store.consume(&id, ip(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_valid_before_expiry() {
        let store = TicketStore::new();
        let id = store.issue("alice", "tok", ip(1));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.consume(&id, ip(1)).is_some());
    }
}
