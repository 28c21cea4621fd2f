use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::principal::{Identity, Principal};
use crate::security::{self, HashError};

pub type SessionToken = String;

const TOKEN_BYTES: usize = 32;
// base64url without padding of TOKEN_BYTES
const TOKEN_LEN: usize = 43;
const ISSUE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session token generation failed: {0}")]
    Random(#[from] HashError),
    #[error("could not allocate an unused session token")]
    TokenExhausted,
    #[error("user sessions were revoked while the session was being issued")]
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Safe to log; the token is not.
    pub session_id: Uuid,
    pub token: SessionToken,
    pub principal: Principal,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Result of [`SessionStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Yes,
    /// The token is already taken.
    Collision,
    /// `remove_user` ran for this user after the expected generation was read.
    Stale,
}

/// Keyed, synchronized storage for sessions. Every method is one atomic step.
pub trait SessionStore: Send + Sync {
    /// Insert unless the token is already present. With `expected`, the
    /// insert also fails when the user's generation has moved past it.
    fn insert(&self, session: Session, expected: Option<u64>) -> Inserted;
    fn get(&self, token: &str) -> Option<Session>;
    fn remove(&self, token: &str) -> Option<Session>;
    /// Remove every session of the user and bump their generation.
    fn remove_user(&self, user_id: i64) -> usize;
    fn generation(&self, user_id: i64) -> u64;
    fn remove_expired(&self, now: DateTime<Utc>) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Sessions {
    by_token: HashMap<SessionToken, Session>,
    by_user: HashMap<i64, HashSet<SessionToken>>,
    generations: HashMap<i64, u64>,
}

impl Sessions {
    fn unlink(&mut self, token: &str, user_id: i64) {
        if let Some(set) = self.by_user.get_mut(&user_id) {
            set.remove(token);
            if set.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
    }
}

/// Single-process store. Both indexes sit behind one lock so a reader never
/// sees one updated without the other.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: RwLock<Sessions>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: Session, expected: Option<u64>) -> Inserted {
        let mut s = self.inner.write();
        let uid = session.principal.user_id;
        if expected.is_some_and(|g| s.generations.get(&uid).copied().unwrap_or(0) != g) {
            return Inserted::Stale;
        }
        if s.by_token.contains_key(&session.token) {
            return Inserted::Collision;
        }
        s.by_user
            .entry(session.principal.user_id)
            .or_default()
            .insert(session.token.clone());
        s.by_token.insert(session.token.clone(), session);
        Inserted::Yes
    }

    fn get(&self, token: &str) -> Option<Session> {
        self.inner.read().by_token.get(token).cloned()
    }

    fn remove(&self, token: &str) -> Option<Session> {
        let mut s = self.inner.write();
        let removed = s.by_token.remove(token)?;
        s.unlink(token, removed.principal.user_id);
        Some(removed)
    }

    fn remove_user(&self, user_id: i64) -> usize {
        let mut s = self.inner.write();
        *s.generations.entry(user_id).or_default() += 1;
        let Some(tokens) = s.by_user.remove(&user_id) else { return 0 };
        let mut count = 0;
        for t in &tokens {
            if s.by_token.remove(t).is_some() {
                count += 1;
            }
        }
        count
    }

    fn generation(&self, user_id: i64) -> u64 {
        self.inner.read().generations.get(&user_id).copied().unwrap_or(0)
    }

    fn remove_expired(&self, now: DateTime<Utc>) -> usize {
        let mut s = self.inner.write();
        let dead: Vec<(SessionToken, i64)> = s
            .by_token
            .values()
            .filter(|sess| !sess.is_live_at(now))
            .map(|sess| (sess.token.clone(), sess.principal.user_id))
            .collect();
        for (token, uid) in &dead {
            s.by_token.remove(token);
            s.unlink(token, *uid);
        }
        dead.len()
    }

    fn len(&self) -> usize {
        self.inner.read().by_token.len()
    }
}

fn gen_token() -> Result<SessionToken, HashError> {
    let mut buf = [0u8; TOKEN_BYTES];
    security::random_bytes(&mut buf)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

// Cheap shape check before touching the store; tokens arrive from clients.
fn well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Issues, resolves and revokes sessions with a fixed TTL.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ttl: TimeDelta,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), Duration::from_secs(60 * 60))
    }
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        Self { store, ttl }
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub fn issue(&self, principal: Principal) -> Result<Session, SessionError> {
        self.issue_at(principal, Utc::now())
    }

    pub fn issue_at(&self, principal: Principal, now: DateTime<Utc>) -> Result<Session, SessionError> {
        self.issue_checked(principal, now, None)
    }

    /// Revocation generation for a user; read it before checking credentials
    /// and hand it to `issue_current`.
    pub fn generation(&self, user_id: i64) -> u64 {
        self.store.generation(user_id)
    }

    /// Issue only if `revoke_user` has not run for this user since
    /// `generation` was read; otherwise `SessionError::Revoked`.
    pub fn issue_current(&self, principal: Principal, generation: u64) -> Result<Session, SessionError> {
        self.issue_checked(principal, Utc::now(), Some(generation))
    }

    fn issue_checked(
        &self,
        principal: Principal,
        now: DateTime<Utc>,
        expected: Option<u64>,
    ) -> Result<Session, SessionError> {
        let expires_at = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        for _ in 0..ISSUE_ATTEMPTS {
            let sess = Session {
                session_id: Uuid::new_v4(),
                token: gen_token()?,
                principal: principal.clone(),
                issued_at: now,
                expires_at,
            };
            match self.store.insert(sess.clone(), expected) {
                Inserted::Yes => {}
                Inserted::Collision => continue,
                Inserted::Stale => return Err(SessionError::Revoked),
            }
            debug!(
                target: "session",
                user = %principal.username,
                sid = %sess.session_id,
                ttl_secs = self.ttl.num_seconds(),
                "session.issue"
            );
            return Ok(sess);
        }
        Err(SessionError::TokenExhausted)
    }

    pub fn resolve(&self, token: &str) -> Identity {
        self.resolve_at(token, Utc::now())
    }

    /// Unknown, revoked and expired tokens all come back `Anonymous`.
    pub fn resolve_at(&self, token: &str, now: DateTime<Utc>) -> Identity {
        if !well_formed(token) {
            return Identity::Anonymous;
        }
        match self.store.get(token) {
            Some(sess) if sess.is_live_at(now) => Identity::User(sess.principal),
            Some(sess) => {
                // Tokens are never reissued, so this cannot drop a newer session.
                self.store.remove(token);
                debug!(target: "session", sid = %sess.session_id, "session.expired");
                Identity::Anonymous
            }
            None => Identity::Anonymous,
        }
    }

    /// Idempotent. Returns whether a session was actually removed.
    pub fn revoke(&self, token: &str) -> bool {
        match self.store.remove(token) {
            Some(sess) => {
                debug!(
                    target: "session",
                    user = %sess.principal.username,
                    sid = %sess.session_id,
                    "session.revoke"
                );
                true
            }
            None => false,
        }
    }

    pub fn revoke_user(&self, user_id: i64) -> usize {
        let count = self.store.remove_user(user_id);
        debug!(target: "session", user_id, count, "session.revoke_user");
        count
    }

    pub fn purge_expired(&self) -> usize {
        self.store.remove_expired(Utc::now())
    }

    pub fn active_count(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn principal(id: i64, name: &str) -> Principal {
        Principal { user_id: id, username: name.into(), name: name.into(), role: Role::User }
    }

    fn manager(ttl_secs: u64) -> SessionManager {
        SessionManager::new(Arc::new(MemorySessionStore::new()), Duration::from_secs(ttl_secs))
    }

    #[test]
    fn issued_token_resolves_to_its_user() {
        let sm = manager(60);
        let s = sm.issue(principal(1, "alice")).unwrap();
        assert_eq!(s.token.len(), TOKEN_LEN);
        assert_eq!(sm.resolve(&s.token), Identity::User(principal(1, "alice")));
    }

    #[test]
    fn revoke_is_immediate_and_idempotent() {
        let sm = manager(60);
        let s = sm.issue(principal(1, "alice")).unwrap();
        assert!(sm.revoke(&s.token));
        assert_eq!(sm.resolve(&s.token), Identity::Anonymous);
        assert!(!sm.revoke(&s.token));
        assert!(!sm.revoke("never-issued"));
        assert_eq!(sm.resolve(&s.token), Identity::Anonymous);
    }

    #[test]
    fn ttl_boundary_is_exclusive() {
        let sm = manager(30);
        let t0 = Utc::now();
        let s = sm.issue_at(principal(1, "alice"), t0).unwrap();
        assert_eq!(s.expires_at, t0 + TimeDelta::seconds(30));

        let just_before = s.expires_at - TimeDelta::nanoseconds(1);
        assert!(!sm.resolve_at(&s.token, t0).is_anonymous());
        assert!(!sm.resolve_at(&s.token, just_before).is_anonymous());
        assert!(sm.resolve_at(&s.token, s.expires_at).is_anonymous());
        // expired is terminal, even when asked about an earlier instant
        assert!(sm.resolve_at(&s.token, t0).is_anonymous());
        assert_eq!(sm.active_count(), 0);
    }

    #[test]
    fn malformed_tokens_are_anonymous() {
        let sm = manager(60);
        sm.issue(principal(1, "alice")).unwrap();
        let long = "a".repeat(TOKEN_LEN + 1);
        let bad_chars = "!".repeat(TOKEN_LEN);
        for t in ["", "x", "../../etc/passwd", long.as_str(), bad_chars.as_str()] {
            assert!(sm.resolve(t).is_anonymous(), "{t:?}");
        }
    }

    #[test]
    fn revoke_user_drops_all_of_their_sessions() {
        let sm = manager(60);
        let a1 = sm.issue(principal(1, "alice")).unwrap();
        let a2 = sm.issue(principal(1, "alice")).unwrap();
        let b = sm.issue(principal(2, "bob")).unwrap();
        assert_eq!(sm.revoke_user(1), 2);
        assert!(sm.resolve(&a1.token).is_anonymous());
        assert!(sm.resolve(&a2.token).is_anonymous());
        assert!(!sm.resolve(&b.token).is_anonymous());
        assert_eq!(sm.revoke_user(1), 0);
    }

    #[test]
    fn issue_after_revoke_user_is_refused() {
        let sm = manager(60);
        let gen = sm.generation(1);
        assert_eq!(sm.revoke_user(1), 0);
        assert!(matches!(sm.issue_current(principal(1, "alice"), gen), Err(SessionError::Revoked)));
        assert_eq!(sm.active_count(), 0);

        // other users and a fresh generation are unaffected
        sm.issue_current(principal(2, "bob"), sm.generation(2)).unwrap();
        let s = sm.issue_current(principal(1, "alice"), sm.generation(1)).unwrap();
        assert!(!sm.resolve(&s.token).is_anonymous());
    }

    #[test]
    fn purge_removes_only_expired() {
        let store = Arc::new(MemorySessionStore::new());
        let sm = SessionManager::new(store.clone(), Duration::from_secs(60));
        let old = Utc::now() - TimeDelta::seconds(120);
        sm.issue_at(principal(1, "alice"), old).unwrap();
        let live = sm.issue(principal(2, "bob")).unwrap();
        assert_eq!(sm.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(!sm.resolve(&live.token).is_anonymous());
    }

    #[test]
    fn concurrent_issue_yields_distinct_resolvable_tokens() {
        let sm = manager(60);
        let sessions: Vec<Session> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..64)
                .map(|i| {
                    let sm = &sm;
                    scope.spawn(move || sm.issue(principal(i, &format!("user{i}"))).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let tokens: HashSet<_> = sessions.iter().map(|s| s.token.clone()).collect();
        assert_eq!(tokens.len(), 64);
        for s in &sessions {
            assert_eq!(sm.resolve(&s.token).principal(), Some(&s.principal));
        }
    }

    #[test]
    fn revoke_racing_resolve_never_tears() {
        let sm = manager(60);
        for i in 0..50 {
            let p = principal(i, "alice");
            let s = sm.issue(p.clone()).unwrap();
            std::thread::scope(|scope| {
                let reader = scope.spawn(|| {
                    (0..100).map(|_| sm.resolve(&s.token)).collect::<Vec<_>>()
                });
                scope.spawn(|| sm.revoke(&s.token));
                for id in reader.join().unwrap() {
                    assert!(id == Identity::Anonymous || id == Identity::User(p.clone()));
                }
            });
            assert!(sm.resolve(&s.token).is_anonymous());
        }
    }
}
