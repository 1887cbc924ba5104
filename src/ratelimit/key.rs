//! Accounting key derivation.

use std::collections::HashMap;

use super::rules::RateLimitConfig;

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// What the transport layer knows about an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller identity resolved by authentication (API key, subject)
    pub identity: Option<String>,
    /// Network origin, usually the client IP
    pub origin: Option<String>,
    /// HTTP method
    pub method: String,
    /// Matched route template, e.g. `/api/v1/urls/{id}`
    pub route_template: Option<String>,
    /// Raw request path
    pub path: String,
    /// Additional attributes available to keying policies
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_route(mut self, template: impl Into<String>) -> Self {
        self.route_template = Some(template.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// The route template if one was matched, otherwise the raw path.
    pub fn route(&self) -> &str {
        self.route_template.as_deref().unwrap_or(&self.path)
    }
}

/// Builds accounting keys of the form
/// `prefix:identity:origin:METHOD:route`.
///
/// Every component but the route is escaped so that a `:` inside an identity
/// or an IPv6 origin cannot shift the component boundaries; two distinct
/// buckets therefore never share a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the key for a request, honoring the config's key override.
    pub fn build(&self, request: &RequestContext, config: &RateLimitConfig) -> String {
        match config.key_override() {
            Some(key_fn) => key_fn(request),
            None => self.default_key(request),
        }
    }

    /// The default per-caller, per-origin, per-route derivation.
    pub fn default_key(&self, request: &RequestContext) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            escape_component(&self.prefix),
            escape_component(request.identity.as_deref().unwrap_or("anonymous")),
            escape_component(request.origin.as_deref().unwrap_or("unknown")),
            escape_component(&request.method.to_ascii_uppercase()),
            request.route(),
        )
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Percent-escape the separator, the scope marker `~` and the escape
/// character itself.
pub fn escape_component(value: &str) -> String {
    if !value.contains([':', '%', '~']) {
        return value.to_string();
    }
    let mut escaped = String::with_capacity(value.len() + 6);
    for ch in value.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '~' => escaped.push_str("%7E"),
            other => escaped.push(other),
        }
    }
    escaped
}
