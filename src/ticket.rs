use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Everything a validated ticket binds the streaming connection to.
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub token: String,
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    pub conversation_id: Option<i64>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketError {
    NotFound,
    Expired,
}

/// Short-lived, single-use tickets for upgrading an authenticated HTTP
/// session into a streaming connection. Consuming a ticket removes it, so a
/// replayed token reads as not found. Expiry is checked against the TTL plus
/// a skew tolerance, guarding against clock drift between the issuing and
/// validating nodes.
pub struct TicketStore {
    tickets: Mutex<HashMap<String, StreamTicket>>,
    ttl: Duration,
    skew: Duration,
}

impl TicketStore {
    pub fn new(ttl_secs: u64, skew_secs: u64) -> Self {
        TicketStore {
            tickets: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
            skew: Duration::from_secs(skew_secs),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        conversation_id: Option<i64>,
    ) -> String {
        let token = format!("st_{}", uuid::Uuid::new_v4().simple());
        let ticket = StreamTicket {
            token: token.clone(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            conversation_id,
            issued_at: Utc::now(),
        };
        let mut tickets = self.tickets.lock().await;
        // Opportunistic hygiene on the hot path; a periodic purge also runs.
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl + self.skew).unwrap_or_else(|_| chrono::Duration::zero());
        tickets.retain(|_, t| t.issued_at > cutoff);
        tickets.insert(token.clone(), ticket);
        token
    }

    /// Atomic read-and-delete: a ticket is valid for exactly one successful
    /// call; a second call with the same token reports `NotFound`.
    pub async fn consume(&self, token: &str) -> Result<StreamTicket, TicketError> {
        let ticket = {
            let mut tickets = self.tickets.lock().await;
            tickets.remove(token).ok_or(TicketError::NotFound)?
        };
        let age = Utc::now().signed_duration_since(ticket.issued_at);
        let limit = chrono::Duration::from_std(self.ttl + self.skew).unwrap_or_else(|_| chrono::Duration::zero());
        if age > limit {
            return Err(TicketError::Expired);
        }
        Ok(ticket)
    }

    pub async fn purge_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl + self.skew).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tickets = self.tickets.lock().await;
        let before = tickets.len();
        tickets.retain(|_, t| t.issued_at > cutoff);
        before - tickets.len()
    }

    pub async fn outstanding(&self) -> usize {
        self.tickets.lock().await.len()
    }
}
