//! Request authorization.
//!
//! A `Policy` maps (identity, method, path) to allow/deny. The engine knows
//! nothing about sessions or credentials, so the rules can be swapped
//! without touching either. `RuleSet` denies anything no rule matches;
//! `AllowAll` must be chosen by name and is never a fallback.

use std::fmt;
use std::sync::Arc;

use http::Method;

use super::principal::Identity;

#[derive(Debug, Clone, Copy)]
pub struct AuthorizationRequest<'a> {
    pub identity: &'a Identity,
    pub method: &'a Method,
    pub path: &'a str,
}

impl<'a> AuthorizationRequest<'a> {
    pub fn new(identity: &'a Identity, method: &'a Method, path: &'a str) -> Self {
        Self { identity, method, path }
    }
}

pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Must be pure: same request, same answer.
    fn evaluate(&self, req: &AuthorizationRequest<'_>) -> bool;
}

/// Every request passes. Only reachable by selecting it explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn name(&self) -> &str {
        "allow-all"
    }

    fn evaluate(&self, _req: &AuthorizationRequest<'_>) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Policy for DenyAll {
    fn name(&self) -> &str {
        "deny-all"
    }

    fn evaluate(&self, _req: &AuthorizationRequest<'_>) -> bool {
        false
    }
}

/// Adapts a plain function or closure into a named policy.
pub struct FnPolicy<F> {
    name: String,
    f: F,
}

impl<F> FnPolicy<F>
where
    F: Fn(&AuthorizationRequest<'_>) -> bool + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Policy for FnPolicy<F>
where
    F: Fn(&AuthorizationRequest<'_>) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, req: &AuthorizationRequest<'_>) -> bool {
        (self.f)(req)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    /// `/api/accounts/*`: the prefix itself and anything below it.
    Subtree(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/*") {
            Some(prefix) => PathPattern::Subtree(normalize(prefix).to_string()),
            None => PathPattern::Exact(normalize(pattern).to_string()),
        }
    }

    fn matches(&self, path: &str) -> bool {
        let path = normalize(path);
        match self {
            PathPattern::Exact(p) => path == p,
            PathPattern::Subtree(p) => {
                path == p || path.strip_prefix(p.as_str()).is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

// "/api/users/" and "/api/users" name the same resource.
fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Anyone,
    Authenticated,
    Admin,
}

impl Audience {
    fn admits(self, identity: &Identity) -> bool {
        match self {
            Audience::Anyone => true,
            Audience::Authenticated => !identity.is_anonymous(),
            Audience::Admin => identity.principal().is_some_and(|p| p.is_admin()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Empty means any method.
    pub methods: Vec<Method>,
    pub path: PathPattern,
    pub audience: Audience,
    pub effect: Effect,
}

impl Rule {
    pub fn allow(methods: &[Method], path: &str, audience: Audience) -> Self {
        Self { methods: methods.to_vec(), path: PathPattern::parse(path), audience, effect: Effect::Allow }
    }

    pub fn deny(methods: &[Method], path: &str) -> Self {
        Self { methods: methods.to_vec(), path: PathPattern::parse(path), audience: Audience::Anyone, effect: Effect::Deny }
    }

    fn applies_to(&self, req: &AuthorizationRequest<'_>) -> bool {
        (self.methods.is_empty() || self.methods.contains(req.method)) && self.path.matches(req.path)
    }
}

/// Ordered rules; the first rule whose method and path match decides.
#[derive(Debug, Clone)]
pub struct RuleSet {
    name: String,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), rules: Vec::new() }
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl Policy for RuleSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, req: &AuthorizationRequest<'_>) -> bool {
        match self.rules.iter().find(|r| r.applies_to(req)) {
            Some(rule) => rule.effect == Effect::Allow && rule.audience.admits(req.identity),
            None => false,
        }
    }
}

/// Route rules for the duit API.
pub fn duit_rules() -> RuleSet {
    use Audience::{Admin, Anyone, Authenticated};
    let any: &[Method] = &[];
    let crud = &[Method::GET, Method::POST, Method::PUT, Method::DELETE];

    RuleSet::new("roles")
        .rule(Rule::allow(&[Method::POST], "/api/login", Anyone))
        .rule(Rule::allow(&[Method::POST], "/api/logout", Anyone))
        .rule(Rule::allow(&[Method::PUT], "/api/user/password", Authenticated))
        .rule(Rule::allow(&[Method::PUT], "/api/user/password/reset", Admin))
        .rule(Rule::allow(&[Method::GET, Method::DELETE], "/api/users", Admin))
        .rule(Rule::allow(&[Method::POST, Method::PUT], "/api/user", Admin))
        .rule(Rule::allow(crud, "/api/accounts/*", Authenticated))
        .rule(Rule::allow(crud, "/api/account/*", Authenticated))
        .rule(Rule::allow(crud, "/api/entries/*", Authenticated))
        .rule(Rule::allow(crud, "/api/entry/*", Authenticated))
        .rule(Rule::allow(&[Method::GET], "/api/charts", Authenticated))
        .rule(Rule::deny(any, "/api/*"))
}

/// Named policy choices exposed through configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PolicyKind {
    /// Role-based route rules, default deny.
    #[default]
    Roles,
    /// Every request is allowed, including anonymous ones.
    AllowAll,
    /// Every request is refused.
    DenyAll,
}

impl PolicyKind {
    pub fn build(self) -> Arc<dyn Policy> {
        match self {
            PolicyKind::Roles => Arc::new(duit_rules()),
            PolicyKind::AllowAll => Arc::new(AllowAll),
            PolicyKind::DenyAll => Arc::new(DenyAll),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyKind::Roles => "roles",
            PolicyKind::AllowAll => "allow-all",
            PolicyKind::DenyAll => "deny-all",
        })
    }
}
