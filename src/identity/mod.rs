//! Identity, sessions and request authorization for the duit API.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod credentials;
mod request_context;
mod policy;
mod authenticator;

pub use principal::{Identity, Principal, Role};
pub use session::{Inserted, MemorySessionStore, Session, SessionError, SessionManager, SessionStore, SessionToken};
pub use credentials::{Credential, CredentialStore, SqlCredentialStore};
pub use request_context::RequestContext;
pub use policy::{
    duit_rules, AllowAll, Audience, AuthorizationRequest, DenyAll, Effect, FnPolicy, PathPattern, Policy,
    PolicyKind, Rule, RuleSet,
};
pub use authenticator::{AuthError, AuthResult, Authenticator};
