//! MCP session lifecycle.
//!
//! Sessions are minted by `initialize`, echoed back through the
//! `MCP-Session-Id` header, and evicted on inactivity, max lifetime,
//! explicit DELETE, or shutdown. Each session carries a broadcast channel
//! that feeds its SSE stream; termination publishes a final
//! `session_terminated` event before the sender is dropped.

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// Fallback when the configured inactivity timeout is zero.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Fallback when the configured max lifetime is zero.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Sweep cadence: half the smaller effective window, at least one second.
pub fn sweep_interval(inactivity: Duration, max_lifetime: Duration) -> Duration {
    let inactivity = effective(inactivity, DEFAULT_INACTIVITY_TIMEOUT);
    let max_lifetime = effective(max_lifetime, DEFAULT_MAX_LIFETIME);
    std::cmp::max(
        Duration::from_secs(1),
        std::cmp::min(inactivity, max_lifetime) / 2,
    )
}

fn effective(configured: Duration, fallback: Duration) -> Duration {
    if configured.is_zero() {
        fallback
    } else {
        configured
    }
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: String,
    pub data: serde_json::Value,
}

pub struct Session {
    pub id: String,
    pub protocol_version: String,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    initialized: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    fn new(id: String, protocol_version: String) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let now = Instant::now();
        Self {
            id,
            protocol_version,
            created_at: now,
            last_activity: Mutex::new(now),
            initialized: AtomicBool::new(false),
            events,
        }
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        // Last writer wins; monotonicity is best-effort.
        *self.last_activity.lock() = Instant::now();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish an event to this session's SSE subscribers, if any.
    pub fn publish(&self, kind: &str, data: serde_json::Value) {
        let _ = self.events.send(SessionEvent {
            kind: kind.to_string(),
            data,
        });
    }

    fn expired(&self, now: Instant, inactivity: Duration, max_lifetime: Duration) -> bool {
        let idle = now.saturating_duration_since(*self.last_activity.lock());
        let age = now.saturating_duration_since(self.created_at);
        idle > inactivity || age > max_lifetime
    }
}

pub enum SessionLookup {
    Found(Arc<Session>),
    NotFound,
    Expired,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    inactivity_timeout: Duration,
    max_lifetime: Duration,
}

impl SessionRegistry {
    /// Zero timeouts are treated as unset and replaced with the defaults.
    pub fn new(inactivity_timeout: Duration, max_lifetime: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            inactivity_timeout: effective(inactivity_timeout, DEFAULT_INACTIVITY_TIMEOUT),
            max_lifetime: effective(max_lifetime, DEFAULT_MAX_LIFETIME),
        }
    }

    pub fn create(&self, protocol_version: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(new_session_id(), protocol_version.to_string()));
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        debug!("session {} created", session.id);
        session
    }

    pub fn lookup(&self, id: &str) -> SessionLookup {
        let session = match self.sessions.read().get(id) {
            Some(session) => session.clone(),
            None => return SessionLookup::NotFound,
        };
        if session.expired(Instant::now(), self.inactivity_timeout, self.max_lifetime) {
            self.terminate(id, "expired");
            return SessionLookup::Expired;
        }
        SessionLookup::Found(session)
    }

    pub fn touch(&self, id: &str) {
        if let Some(session) = self.sessions.read().get(id) {
            session.touch();
        }
    }

    /// Explicit termination (DELETE). Returns false for unknown ids.
    pub fn delete(&self, id: &str) -> bool {
        self.terminate(id, "delete")
    }

    /// Evict expired sessions; returns the ids removed.
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.expired(now, self.inactivity_timeout, self.max_lifetime))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            self.terminate(id, "expired");
        }
        expired
    }

    /// Terminate every session; used on server shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in &ids {
            self.terminate(id, "shutdown");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn sweep_interval(&self) -> Duration {
        sweep_interval(self.inactivity_timeout, self.max_lifetime)
    }

    fn terminate(&self, id: &str, reason: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(session) => {
                session.publish(
                    "session_terminated",
                    json!({"session": id, "reason": reason}),
                );
                debug!("session {} terminated ({})", id, reason);
                true
            }
            None => false,
        }
    }
}

/// Opaque URL-safe session token: 32 random bytes, hex-encoded.
fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_follows_the_half_rule() {
        let hour = Duration::from_secs(3600);
        let day = Duration::from_secs(86400);
        assert_eq!(sweep_interval(hour, day), Duration::from_secs(1800));
        assert_eq!(sweep_interval(day, hour), Duration::from_secs(1800));
        // Zero is unset: defaults are 24h inactivity and 1h lifetime, the
        // smaller of which wins.
        assert_eq!(
            sweep_interval(Duration::ZERO, Duration::ZERO),
            Duration::from_secs(1800)
        );
        // Tiny windows clamp at one second.
        assert_eq!(
            sweep_interval(Duration::from_secs(1), Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn ids_are_unique_and_url_safe() {
        let registry = SessionRegistry::new(Duration::ZERO, Duration::ZERO);
        let a = registry.create("2025-06-18");
        let b = registry.create("2025-06-18");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn lookup_and_delete() {
        let registry = SessionRegistry::new(Duration::ZERO, Duration::ZERO);
        let session = registry.create("2025-06-18");

        assert!(matches!(
            registry.lookup(&session.id),
            SessionLookup::Found(_)
        ));
        assert!(matches!(registry.lookup("bogus"), SessionLookup::NotFound));

        assert!(registry.delete(&session.id));
        assert!(!registry.delete(&session.id));
        assert!(matches!(
            registry.lookup(&session.id),
            SessionLookup::NotFound
        ));
    }

    #[test]
    fn sweep_evicts_expired_sessions() {
        let registry =
            SessionRegistry::new(Duration::from_millis(5), Duration::from_secs(3600));
        let session = registry.create("2025-06-18");
        std::thread::sleep(Duration::from_millis(20));

        let removed = registry.sweep(Instant::now());
        assert_eq!(removed, vec![session.id.clone()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn expired_lookup_reports_expired_then_not_found() {
        let registry =
            SessionRegistry::new(Duration::from_millis(5), Duration::from_secs(3600));
        let session = registry.create("2025-06-18");
        std::thread::sleep(Duration::from_millis(20));

        assert!(matches!(
            registry.lookup(&session.id),
            SessionLookup::Expired
        ));
        assert!(matches!(
            registry.lookup(&session.id),
            SessionLookup::NotFound
        ));
    }

    #[test]
    fn terminated_session_publishes_reason() {
        let registry = SessionRegistry::new(Duration::ZERO, Duration::ZERO);
        let session = registry.create("2025-06-18");
        let mut rx = session.subscribe();

        registry.delete(&session.id);
        let event = rx.try_recv().expect("termination event");
        assert_eq!(event.kind, "session_terminated");
        assert_eq!(event.data["reason"], "delete");
    }
}
