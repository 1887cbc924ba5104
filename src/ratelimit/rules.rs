//! Per-route rate limit rules.
//!
//! Rules are read from YAML once at startup and compiled into an immutable
//! [`RouteTable`]. Each rule resolves to a validated [`RateLimitConfig`].
//!
//! ```yaml
//! key_prefix: ratelimit
//! routes:
//!   - route: /api/v1/urls
//!     method: POST
//!     preset: create
//!   - route: /api/v1/urls/*
//!     max_requests: 100
//!     key_by:
//!       attribute: org_id
//!     skip_identities: [internal-batch]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::key::{escape_component, RequestContext, DEFAULT_KEY_PREFIX};
use crate::error::{Result, TurnstileError};

/// Window applied when a rule does not name one.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;
/// Ceiling applied when a rule does not name one.
pub const DEFAULT_MAX_REQUESTS: u64 = 100;
/// Rejection message used when a rule does not name one.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Second component of every rule-scoped key. `~` is escaped in default key
/// components, so no default key can carry it in that position.
const SCOPE_MARKER: &str = "~scope";

/// Replaces the default key derivation.
pub type KeyFn = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;
/// Exempts a request from accounting when it returns `true`.
pub type SkipFn = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

/// A resolved, validated rate limit.
///
/// Values are built once and never mutated while serving requests.
#[derive(Clone)]
pub struct RateLimitConfig {
    window_ms: u64,
    max_requests: u64,
    key_override: Option<KeyFn>,
    skip_predicate: Option<SkipFn>,
    rejection_message: Option<String>,
}

impl RateLimitConfig {
    /// Create a config, rejecting a zero window or zero limit.
    pub fn new(window_ms: u64, max_requests: u64) -> Result<Self> {
        if window_ms == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            window_ms,
            max_requests,
            key_override: None,
            skip_predicate: None,
            rejection_message: None,
        })
    }

    /// The limit described by a preset.
    pub fn preset(preset: Preset) -> Self {
        let (window_ms, max_requests) = preset.limits();
        Self {
            window_ms,
            max_requests,
            key_override: None,
            skip_predicate: None,
            rejection_message: None,
        }
    }

    pub fn with_key_override(mut self, key_fn: KeyFn) -> Self {
        self.key_override = Some(key_fn);
        self
    }

    pub fn with_skip_predicate(mut self, skip_fn: SkipFn) -> Self {
        self.skip_predicate = Some(skip_fn);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.rejection_message = Some(message.into());
        self
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn key_override(&self) -> Option<&KeyFn> {
        self.key_override.as_ref()
    }

    /// Whether this request is exempt from the limit.
    pub fn should_skip(&self, request: &RequestContext) -> bool {
        self.skip_predicate
            .as_ref()
            .is_some_and(|skip| skip(request))
    }

    pub fn rejection_message(&self) -> &str {
        self.rejection_message.as_deref().unwrap_or(DEFAULT_MESSAGE)
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("key_override", &self.key_override.is_some())
            .field("skip_predicate", &self.skip_predicate.is_some())
            .field("rejection_message", &self.rejection_message)
            .finish()
    }
}

/// Named limits for common kinds of endpoint, all per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Strict,
    Normal,
    Relaxed,
    Create,
    Read,
    Update,
    Delete,
}

impl Preset {
    /// `(window_ms, max_requests)` for this preset.
    pub fn limits(&self) -> (u64, u64) {
        let max = match self {
            Preset::Strict => 10,
            Preset::Normal => 60,
            Preset::Relaxed => 100,
            Preset::Create => 20,
            Preset::Read => 200,
            Preset::Update => 30,
            Preset::Delete => 10,
        };
        (60_000, max)
    }
}

/// How the accounting key of a rule is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBy {
    /// Identity, origin, method and route
    #[default]
    Default,
    /// Identity only, shared across routes matched by the rule
    Identity,
    /// Origin only, shared across routes matched by the rule
    Origin,
    /// A named request attribute, e.g. an organization id
    Attribute(String),
}

/// Top-level rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    /// Prefix of every accounting key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Route rules
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// One route's rate limit declaration.
///
/// Fields left out fall back to the preset, then to the service defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route template; a trailing `/*` matches every route under the prefix
    pub route: String,
    /// HTTP method; absent matches any method
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub key_by: KeyBy,
    /// Identities exempt from this limit
    #[serde(default)]
    pub skip_identities: Vec<String>,
}

impl RouteRule {
    /// Compile the rule into a validated config.
    pub fn resolve(&self, key_prefix: &str) -> Result<RateLimitConfig> {
        let (preset_window, preset_max) = self
            .preset
            .map(|p| p.limits())
            .unwrap_or((DEFAULT_WINDOW_MS, DEFAULT_MAX_REQUESTS));

        let window_ms = self.window_ms.unwrap_or(preset_window);
        let max_requests = self.max_requests.unwrap_or(preset_max);

        let mut config = RateLimitConfig::new(window_ms, max_requests).map_err(|e| {
            TurnstileError::InvalidConfiguration(format!("route '{}': {}", self.route, e))
        })?;

        if let Some(message) = &self.message {
            config = config.with_message(message.clone());
        }

        if let Some(key_fn) = self.key_fn(key_prefix) {
            config = config.with_key_override(key_fn);
        }

        if !self.skip_identities.is_empty() {
            let exempt: HashSet<String> = self.skip_identities.iter().cloned().collect();
            config = config.with_skip_predicate(Arc::new(move |req: &RequestContext| {
                req.identity
                    .as_ref()
                    .is_some_and(|identity| exempt.contains(identity))
            }));
        }

        Ok(config)
    }

    fn key_fn(&self, key_prefix: &str) -> Option<KeyFn> {
        let method = self
            .method
            .as_deref()
            .map(|m| escape_component(&m.to_ascii_uppercase()))
            .unwrap_or_else(|| "*".to_string());
        let scope = format!("{}:{}:{}", escape_component(key_prefix), SCOPE_MARKER, method);
        let rule = escape_component(&self.route);
        match &self.key_by {
            KeyBy::Default => None,
            KeyBy::Identity => Some(Arc::new(move |req: &RequestContext| {
                format!(
                    "{}:{}:identity:{}",
                    scope,
                    rule,
                    escape_component(req.identity.as_deref().unwrap_or("anonymous"))
                )
            })),
            KeyBy::Origin => Some(Arc::new(move |req: &RequestContext| {
                format!(
                    "{}:{}:origin:{}",
                    scope,
                    rule,
                    escape_component(req.origin.as_deref().unwrap_or("unknown"))
                )
            })),
            KeyBy::Attribute(name) => {
                let attribute = name.clone();
                let label = escape_component(name);
                Some(Arc::new(move |req: &RequestContext| {
                    let value = req
                        .attributes
                        .get(&attribute)
                        .map(String::as_str)
                        .unwrap_or("none");
                    format!("{}:{}:{}:{}", scope, rule, label, escape_component(value))
                }))
            }
        }
    }

    fn matcher(&self) -> RouteMatcher {
        match self.route.strip_suffix("/*") {
            Some(prefix) => RouteMatcher::Prefix(prefix.to_string()),
            None => RouteMatcher::Exact(self.route.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RouteMatcher {
    Exact(String),
    Prefix(String),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    method: Option<String>,
    matcher: RouteMatcher,
    config: RateLimitConfig,
}

impl CompiledRule {
    fn method_matches(&self, method: &str) -> bool {
        self.method
            .as_deref()
            .map_or(true, |m| m.eq_ignore_ascii_case(method))
    }
}

/// Immutable lookup from (method, route) to the limit that applies.
#[derive(Debug, Clone)]
pub struct RouteTable {
    key_prefix: String,
    rules: Vec<CompiledRule>,
}

impl RouteTable {
    /// A table with no limits: every route is unlimited.
    pub fn new() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            rules: Vec::new(),
        }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse route rules: {}", e)))?;
        Self::from_rules(file)
    }

    /// Compile parsed rules, validating every one of them.
    pub fn from_rules(file: RulesFile) -> Result<Self> {
        let mut rules = Vec::with_capacity(file.routes.len());
        for rule in &file.routes {
            let config = rule.resolve(&file.key_prefix)?;
            debug!(
                route = %rule.route,
                method = ?rule.method,
                window_ms = config.window_ms(),
                max_requests = config.max_requests(),
                "Compiled route rule"
            );
            rules.push(CompiledRule {
                method: rule.method.clone(),
                matcher: rule.matcher(),
                config,
            });
        }
        Ok(Self {
            key_prefix: file.key_prefix,
            rules,
        })
    }

    /// Register a programmatic limit; a trailing `/*` makes it a prefix rule.
    pub fn with_route(
        mut self,
        method: Option<&str>,
        route: &str,
        config: RateLimitConfig,
    ) -> Self {
        let matcher = match route.strip_suffix("/*") {
            Some(prefix) => RouteMatcher::Prefix(prefix.to_string()),
            None => RouteMatcher::Exact(route.to_string()),
        };
        self.rules.push(CompiledRule {
            method: method.map(str::to_string),
            matcher,
            config,
        });
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the limit for a request.
    ///
    /// Precedence: method-specific exact route, any-method exact route, then
    /// the longest matching prefix (method-specific first at equal length).
    /// `None` means the route is unlimited.
    pub fn find(&self, method: &str, route: &str) -> Option<&RateLimitConfig> {
        let exact = |want_method: bool| {
            self.rules.iter().find(|rule| {
                rule.method.is_some() == want_method
                    && rule.method_matches(method)
                    && matches!(&rule.matcher, RouteMatcher::Exact(r) if r == route)
            })
        };

        if let Some(rule) = exact(true).or_else(|| exact(false)) {
            return Some(&rule.config);
        }

        self.rules
            .iter()
            .filter(|rule| rule.method_matches(method))
            .filter_map(|rule| match &rule.matcher {
                RouteMatcher::Prefix(prefix) if prefix_matches(prefix, route) => {
                    Some((prefix.len(), rule.method.is_some(), rule))
                }
                _ => None,
            })
            .max_by_key(|(len, specific, _)| (*len, *specific))
            .map(|(_, _, rule)| &rule.config)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn prefix_matches(prefix: &str, route: &str) -> bool {
    route == prefix
        || route
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') || prefix.ends_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::KeyBuilder;

    #[test]
    fn test_config_rejects_zero_window() {
        let err = RateLimitConfig::new(0, 10).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_config_rejects_zero_limit() {
        let err = RateLimitConfig::new(1_000, 0).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_config_default_message() {
        let config = RateLimitConfig::new(1_000, 1).unwrap();
        assert_eq!(config.rejection_message(), DEFAULT_MESSAGE);

        let config = config.with_message("slow down");
        assert_eq!(config.rejection_message(), "slow down");
    }

    #[test]
    fn test_preset_limits() {
        assert_eq!(Preset::Strict.limits(), (60_000, 10));
        assert_eq!(Preset::Read.limits(), (60_000, 200));
        assert_eq!(RateLimitConfig::preset(Preset::Update).max_requests(), 30);
    }

    #[test]
    fn test_parse_rules_with_defaults() {
        let yaml = r#"
routes:
  - route: /api/v1/urls
    method: POST
    preset: create
  - route: /api/v1/stats
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        assert_eq!(table.key_prefix(), "ratelimit");
        assert_eq!(table.len(), 2);

        let create = table.find("POST", "/api/v1/urls").unwrap();
        assert_eq!(create.max_requests(), 20);
        assert_eq!(create.window_ms(), 60_000);

        let stats = table.find("GET", "/api/v1/stats").unwrap();
        assert_eq!(stats.max_requests(), DEFAULT_MAX_REQUESTS);
        assert_eq!(stats.window_ms(), DEFAULT_WINDOW_MS);
    }

    #[test]
    fn test_explicit_fields_override_preset() {
        let yaml = r#"
routes:
  - route: /a
    preset: strict
    max_requests: 3
    message: nope
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        let config = table.find("GET", "/a").unwrap();
        assert_eq!(config.max_requests(), 3);
        assert_eq!(config.window_ms(), 60_000);
        assert_eq!(config.rejection_message(), "nope");
    }

    #[test]
    fn test_zero_limit_rule_is_rejected() {
        let yaml = r#"
routes:
  - route: /a
    max_requests: 0
"#;
        let err = RouteTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_unknown_route_is_unlimited() {
        let table = RouteTable::from_yaml("routes:\n  - route: /a\n").unwrap();
        assert!(table.find("GET", "/b").is_none());
        assert!(RouteTable::new().find("GET", "/a").is_none());
    }

    #[test]
    fn test_method_specific_rule_wins() {
        let yaml = r#"
routes:
  - route: /urls
    max_requests: 50
  - route: /urls
    method: delete
    max_requests: 5
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        assert_eq!(table.find("DELETE", "/urls").unwrap().max_requests(), 5);
        assert_eq!(table.find("GET", "/urls").unwrap().max_requests(), 50);
    }

    #[test]
    fn test_exact_rule_beats_prefix_and_longest_prefix_wins() {
        let yaml = r#"
routes:
  - route: /api/*
    max_requests: 1000
  - route: /api/v1/*
    max_requests: 100
  - route: /api/v1/urls
    max_requests: 10
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        assert_eq!(table.find("GET", "/api/v1/urls").unwrap().max_requests(), 10);
        assert_eq!(table.find("GET", "/api/v1/other").unwrap().max_requests(), 100);
        assert_eq!(table.find("GET", "/api/v2/x").unwrap().max_requests(), 1000);
        assert!(table.find("GET", "/apix").is_none());
    }

    #[test]
    fn test_key_by_attribute() {
        let yaml = r#"
routes:
  - route: /reports/*
    key_by:
      attribute: org_id
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        let config = table.find("GET", "/reports/daily").unwrap();
        let key_fn = config.key_override().unwrap();

        let request = RequestContext::new("GET", "/reports/daily").with_attribute("org_id", "acme");
        assert_eq!(key_fn(&request), "ratelimit:~scope:*:/reports/*:org_id:acme");
    }

    #[test]
    fn test_scoped_keys_separate_methods() {
        let yaml = r#"
routes:
  - route: /urls
    max_requests: 50
    key_by: identity
  - route: /urls
    method: delete
    max_requests: 2
    key_by: identity
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        let request = |method: &str| RequestContext::new(method, "/urls").with_identity("u");

        let any = table.find("GET", "/urls").unwrap().key_override().unwrap().clone();
        let delete = table.find("DELETE", "/urls").unwrap().key_override().unwrap().clone();

        assert_eq!(any(&request("GET")), "ratelimit:~scope:*:/urls:identity:u");
        assert_eq!(delete(&request("DELETE")), "ratelimit:~scope:DELETE:/urls:identity:u");
    }

    #[test]
    fn test_scoped_key_never_matches_default_key() {
        let yaml = r#"
routes:
  - route: /r
    method: GET
    key_by:
      attribute: GET
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        let config = table.find("GET", "/r").unwrap();
        let scoped = config.key_override().unwrap()(
            &RequestContext::new("GET", "/r").with_attribute("GET", "v"),
        );

        // Shaped to line up with the scoped layout component by component.
        let lookalike = RequestContext::new("GET", "v")
            .with_identity("~scope")
            .with_origin("GET:/r");
        let default = KeyBuilder::default().default_key(&lookalike);

        assert_ne!(scoped, default);
    }

    #[test]
    fn test_key_by_variants_deserialize() {
        let yaml = r#"
routes:
  - route: /a
    key_by: default
  - route: /b
    key_by: origin
  - route: /c
    key_by:
      attribute: org_id
  - route: /d
"#;
        let file: RulesFile = serde_yaml::from_str(yaml).unwrap();
        let kinds: Vec<KeyBy> = file.routes.into_iter().map(|r| r.key_by).collect();
        assert_eq!(
            kinds,
            vec![
                KeyBy::Default,
                KeyBy::Origin,
                KeyBy::Attribute("org_id".to_string()),
                KeyBy::Default,
            ]
        );
    }

    #[test]
    fn test_key_by_identity_ignores_origin() {
        let yaml = r#"
routes:
  - route: /a
    key_by: identity
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        let key_fn = table.find("GET", "/a").unwrap().key_override().unwrap().clone();

        let one = RequestContext::new("GET", "/a").with_identity("u").with_origin("1.1.1.1");
        let two = RequestContext::new("GET", "/a").with_identity("u").with_origin("2.2.2.2");
        assert_eq!(key_fn(&one), key_fn(&two));
    }

    #[test]
    fn test_skip_identities() {
        let yaml = r#"
routes:
  - route: /a
    skip_identities: [internal]
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        let config = table.find("GET", "/a").unwrap();

        assert!(config.should_skip(&RequestContext::new("GET", "/a").with_identity("internal")));
        assert!(!config.should_skip(&RequestContext::new("GET", "/a").with_identity("other")));
        assert!(!config.should_skip(&RequestContext::new("GET", "/a")));
    }

    #[test]
    fn test_programmatic_route() {
        let table = RouteTable::new().with_route(
            Some("GET"),
            "/health/*",
            RateLimitConfig::new(1_000, 5).unwrap(),
        );
        assert_eq!(table.find("get", "/health/live").unwrap().max_requests(), 5);
        assert!(table.find("POST", "/health/live").is_none());
    }
}
