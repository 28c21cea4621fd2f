use super::Identity;

/// Per-request state the HTTP gate hands to handlers via request extensions.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub identity: Identity,
    pub request_id: String,
    pub token: Option<String>,
}
