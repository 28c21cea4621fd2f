use std::sync::Arc;

use http::Method;
use thiserror::Error;
use tracing::{error, info, warn};

use super::credentials::{Credential, CredentialStore};
use super::policy::{AuthorizationRequest, Policy};
use super::principal::{Identity, Principal};
use super::session::{Session, SessionError, SessionManager};
use crate::security;
use crate::storage::{self, StoreError};

/// The only outcomes handlers ever see. Messages are deliberately generic.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user and wrong secret are indistinguishable.
    #[error("invalid username or password")]
    AuthFailure,

    #[error("access denied")]
    Denied,

    /// Fails closed; the cause is logged, not returned.
    #[error("authentication backend unavailable")]
    StoreUnavailable,
}

pub type AuthResult<T> = Result<T, AuthError>;

fn unavailable(op: &str, e: &dyn std::fmt::Display) -> AuthError {
    error!(target: "auth", op, error = %e, "credential store failure");
    AuthError::StoreUnavailable
}

/// Wires credentials, sessions and policy behind login/logout/authorize.
/// Built once at startup and shared by handle.
pub struct Authenticator {
    credentials: Arc<dyn CredentialStore>,
    sessions: SessionManager,
    policy: Arc<dyn Policy>,
}

impl Authenticator {
    pub fn new(credentials: Arc<dyn CredentialStore>, sessions: SessionManager, policy: Arc<dyn Policy>) -> Self {
        Self { credentials, sessions, policy }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    pub async fn login(&self, cred: &Credential) -> AuthResult<Session> {
        let user = self
            .credentials
            .find_user(&cred.username)
            .await
            .map_err(|e| unavailable("find_user", &e))?;

        let Some(user) = user else {
            let password = cred.password.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || security::burn_verification(&password)).await {
                error!(target: "auth", error = %e, "dummy verification task failed");
            }
            info!(target: "auth", user = %cred.username, "auth.login rejected");
            return Err(AuthError::AuthFailure);
        };
        // Any revoke_user from here on (password change, reset, delete,
        // demotion) makes the issue below fail.
        let generation = self.sessions.generation(user.id);

        let credentials = Arc::clone(&self.credentials);
        let password = cred.password.clone();
        let (user, ok) = tokio::task::spawn_blocking(move || {
            let ok = credentials.verify_secret(&user, &password);
            (user, ok)
        })
        .await
        .map_err(|e| unavailable("verify_secret", &e))?;

        if !ok {
            info!(target: "auth", user = %cred.username, "auth.login rejected");
            return Err(AuthError::AuthFailure);
        }

        // A change that landed before `generation` was read shows up here.
        let current = self
            .credentials
            .get_user(user.id)
            .await
            .map_err(|e| unavailable("get_user", &e))?;
        if current.as_ref() != Some(&user) {
            info!(target: "auth", user = %cred.username, "auth.login rejected: account changed");
            return Err(AuthError::AuthFailure);
        }

        let session = match self.sessions.issue_current(Principal::from(&user), generation) {
            Ok(s) => s,
            Err(SessionError::Revoked) => {
                info!(target: "auth", user = %cred.username, "auth.login rejected: sessions revoked");
                return Err(AuthError::AuthFailure);
            }
            Err(e) => return Err(unavailable("issue", &e)),
        };
        info!(target: "auth", user = %user.username, sid = %session.session_id, "auth.login");
        Ok(session)
    }

    /// Always succeeds, whether or not the token named a live session.
    pub fn logout(&self, token: &str) {
        self.sessions.revoke(token);
    }

    pub fn resolve(&self, token: Option<&str>) -> Identity {
        token.map_or(Identity::Anonymous, |t| self.sessions.resolve(t))
    }

    pub fn authorize(&self, token: Option<&str>, method: &Method, path: &str) -> bool {
        self.check(token, method, path).is_ok()
    }

    /// Like `authorize` but hands back the resolved identity on success.
    pub fn check(&self, token: Option<&str>, method: &Method, path: &str) -> AuthResult<Identity> {
        match self.evaluate(token, method, path) {
            (identity, true) => Ok(identity),
            (_, false) => Err(AuthError::Denied),
        }
    }

    /// Resolve the token once and return the identity with the decision, so
    /// callers can tell "who are you" denials from "not you" denials.
    pub fn evaluate(&self, token: Option<&str>, method: &Method, path: &str) -> (Identity, bool) {
        let identity = self.resolve(token);
        let allowed = self.policy.evaluate(&AuthorizationRequest::new(&identity, method, path));
        if !allowed {
            info!(
                target: "auth",
                user = identity.label(),
                %method,
                path,
                policy = self.policy.name(),
                "auth.denied"
            );
        }
        (identity, allowed)
    }

    /// Verify `old` and store a hash of `new`. All of the user's sessions,
    /// including the caller's, are revoked.
    pub async fn change_password(&self, who: &Principal, old: &str, new: &str) -> AuthResult<()> {
        let user = self
            .credentials
            .get_user(who.user_id)
            .await
            .map_err(|e| unavailable("get_user", &e))?
            .ok_or(AuthError::AuthFailure)?;

        let credentials = Arc::clone(&self.credentials);
        let old = old.to_string();
        let ok = tokio::task::spawn_blocking(move || credentials.verify_secret(&user, &old))
            .await
            .map_err(|e| unavailable("verify_secret", &e))?;
        if !ok {
            info!(target: "auth", user = %who.username, "auth.password_change rejected");
            return Err(AuthError::AuthFailure);
        }

        self.replace_secret(who.user_id, new.to_string()).await?;
        info!(target: "auth", user = %who.username, "auth.password_change");
        Ok(())
    }

    /// Give a user a fresh random password and return it for out-of-band
    /// delivery. Their sessions are revoked.
    pub async fn reset_password(&self, user_id: i64) -> AuthResult<String> {
        let temp = security::generate_temporary_password().map_err(|e| unavailable("reset", &e))?;
        self.replace_secret(user_id, temp.clone()).await?;
        warn!(target: "auth", user_id, "auth.password_reset");
        Ok(temp)
    }

    pub fn revoke_user(&self, user_id: i64) -> usize {
        self.sessions.revoke_user(user_id)
    }

    async fn replace_secret(&self, user_id: i64, secret: String) -> AuthResult<()> {
        let hash = storage::hash_blocking(secret).await.map_err(|e| unavailable("hash", &e))?;
        match self.credentials.set_password_hash(user_id, &hash).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => return Err(AuthError::Denied),
            Err(e) => return Err(unavailable("set_password_hash", &e)),
        }
        self.sessions.revoke_user(user_id);
        Ok(())
    }
}
