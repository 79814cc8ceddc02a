//! Security Gate (C3): token verification, static role authorization,
//! keyed token-bucket rate limiting, and tenant isolation. Every denied
//! request and every allowed mutation is audited onto the event bus.

use crate::config::SecurityConfig;
use crate::error::{ArbiterError, Result};
use crate::events::{Event, EventBus, Payload, Severity, Topic};
use async_trait::async_trait;
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Identity {
    pub identity: String,
    pub tenant: String,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// External contract for authentication. No protocol is specified; this
/// crate ships a static-token verifier for tests and local operation.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity>;
}

pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        self.tokens.get(token).cloned().ok_or(ArbiterError::Unauthorized)
    }
}

/// `operation -> roles that satisfy it`. Any role in the list is
/// sufficient; `cross_tenant_admin` additionally bypasses tenant
/// isolation wherever it appears.
fn authorization_table() -> HashMap<&'static str, &'static [&'static str]> {
    HashMap::from([
        ("agent.register", &["admin", "orchestrator"] as &[&str]),
        ("agent.unregister", &["admin", "orchestrator"] as &[&str]),
        ("agent.query", &["admin", "orchestrator", "submitter"] as &[&str]),
        ("task.submit", &["submitter", "admin"] as &[&str]),
        ("task.cancel", &["submitter", "admin"] as &[&str]),
        ("task.control", &["admin"] as &[&str]),
        ("verdict.waive", &["admin"] as &[&str]),
        ("assignment.ack", &["agent", "admin"] as &[&str]),
        ("assignment.progress", &["agent", "admin"] as &[&str]),
        ("assignment.submit", &["agent", "admin"] as &[&str]),
    ])
}

struct KeyedLimiter {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
    clock: DefaultClock,
}

impl KeyedLimiter {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        let capacity = NonZeroU32::new(capacity.max(1)).unwrap();
        let refill = NonZeroU32::new(refill_per_sec.max(1)).unwrap();
        let quota = Quota::per_second(refill).allow_burst(capacity);
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }

    fn check(&self, key: &str) -> std::result::Result<(), Duration> {
        self.limiter
            .check_key(&key.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

pub struct SecurityGate {
    config: SecurityConfig,
    identity_limiter: KeyedLimiter,
    operation_limiter: KeyedLimiter,
    events: Arc<EventBus>,
    verifier: Arc<dyn IdentityVerifier>,
    authorization: HashMap<&'static str, &'static [&'static str]>,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig, events: Arc<EventBus>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            identity_limiter: KeyedLimiter::new(config.identity_bucket_capacity, config.identity_refill_per_sec),
            operation_limiter: KeyedLimiter::new(config.operation_bucket_capacity, config.operation_refill_per_sec),
            config,
            events,
            verifier,
            authorization: authorization_table(),
        }
    }

    pub async fn authenticate(&self, token: &str) -> Result<Identity> {
        self.verifier.verify(token).await
    }

    /// Full gate: authorize the operation, enforce both rate-limit
    /// buckets, and check tenant isolation against `target_tenant` (the
    /// tenant prefix of the agent/task the operation names, if any).
    pub async fn authorize(&self, identity: &Identity, operation: &str, target_tenant: Option<&str>) -> Result<()> {
        if let Some(required_roles) = self.authorization.get(operation) {
            if !required_roles.iter().any(|role| identity.has_role(role)) {
                self.deny(identity, operation, "missing required role");
                return Err(ArbiterError::Forbidden(format!("{operation} requires one of {required_roles:?}")));
            }
        }

        if let Some(target_tenant) = target_tenant {
            if target_tenant != identity.tenant && !identity.has_role("cross_tenant_admin") {
                self.deny(identity, operation, "tenant mismatch");
                return Err(ArbiterError::Forbidden(format!(
                    "identity tenant {} cannot act on tenant {target_tenant}",
                    identity.tenant
                )));
            }
        }

        if let Err(retry_after) = self.identity_limiter.check(&identity.identity) {
            return Err(self.rate_limited(identity, operation, retry_after));
        }
        let operation_key = format!("{}:{operation}", identity.identity);
        if let Err(retry_after) = self.operation_limiter.check(&operation_key) {
            return Err(self.rate_limited(identity, operation, retry_after));
        }

        Ok(())
    }

    fn rate_limited(&self, identity: &Identity, operation: &str, retry_after: Duration) -> ArbiterError {
        let retry_after_ms = retry_after.as_millis() as u64;
        self.events.publish(Event::new(
            Topic::Security,
            identity.identity.clone(),
            Severity::Warn,
            Payload::SecurityRateLimitExceeded {
                identity: identity.identity.clone(),
                operation: operation.to_string(),
                retry_after_ms,
            },
        ));
        ArbiterError::RateLimited { retry_after_ms }
    }

    fn deny(&self, identity: &Identity, operation: &str, reason: &str) {
        self.events.publish(Event::new(
            Topic::Security,
            identity.identity.clone(),
            Severity::Warn,
            Payload::SecurityAuthzFailed {
                identity: identity.identity.clone(),
                operation: operation.to_string(),
                reason: reason.to_string(),
            },
        ));
    }

    /// Emitted for every allowed mutating request. `payload_fingerprint`
    /// should be a stable hash of the request body, computed by the
    /// caller (the API layer), not reconstructed here.
    pub fn audit(&self, identity: &Identity, operation: &str, target_id: &str, payload_fingerprint: &str) {
        self.events.publish(Event::new(
            Topic::Security,
            identity.identity.clone(),
            Severity::Info,
            Payload::SecurityAudit {
                identity: identity.identity.clone(),
                operation: operation.to_string(),
                target_id: target_id.to_string(),
                payload_fingerprint: payload_fingerprint.to_string(),
            },
        ));
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }
}
