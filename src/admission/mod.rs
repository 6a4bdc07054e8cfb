//! Admission control: every invocation passes here before any work begins.
//!
//! The gateway composes four independently testable checks into one
//! fail-fast decision, in a fixed order: payload size, payload structure,
//! scope authorization, rate limit. The first failure wins and nothing is
//! mutated on rejection; rate counters only advance when admission fully
//! succeeds. The PII scrubber lives in this module but is not a gate; it is
//! applied to payloads before they reach a log line.

pub mod rate_limiter;
pub mod scopes;
pub mod scrubber;
pub mod validator;

use std::sync::Arc;

use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::error::AdmissionError;
use crate::metrics::{
    MetricsSink, PERMISSION_DENIALS_TOTAL, RATE_LIMIT_REJECTIONS_TOTAL, VALIDATION_FAILURES_TOTAL,
};

pub use rate_limiter::{CounterStore, InMemoryCounters, RateLimiter};
pub use scopes::{scope_matches, ScopeAuthorizer};
pub use scrubber::{scrub_text, scrub_value};

/// Pre-invocation gate combining validation, authorization and rate limiting.
#[derive(Debug)]
pub struct AdmissionGateway {
    config: RuntimeConfig,
    authorizer: ScopeAuthorizer,
    limiter: RateLimiter,
    metrics: Arc<MetricsSink>,
}

impl AdmissionGateway {
    pub fn new(
        config: RuntimeConfig,
        authorizer: ScopeAuthorizer,
        limiter: RateLimiter,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            config,
            authorizer,
            limiter,
            metrics,
        }
    }

    /// Run the admission checks for one submission.
    ///
    /// Order: size, structure, authorization, rate. Each rejection is
    /// recorded in the metrics sink under its own counter before being
    /// returned to the caller.
    pub fn admit(
        &self,
        subject: &str,
        capability: &str,
        payload: &Value,
        caller_scopes: &[String],
    ) -> Result<(), AdmissionError> {
        if let Err(err) = validator::check_size(payload, self.config.max_payload_bytes) {
            self.reject(capability, &err);
            return Err(err);
        }
        if let Err(err) = validator::check_structure(payload, &self.config.structure) {
            self.reject(capability, &err);
            return Err(err);
        }
        if let Err(err) = self.authorizer.authorize(capability, caller_scopes) {
            self.reject(capability, &err);
            return Err(err);
        }
        if let Err(err) = self.limiter.check(subject, capability) {
            self.reject(capability, &err);
            return Err(err);
        }

        tracing::debug!(
            subject,
            capability,
            payload = %scrubber::scrub_value(payload),
            "admission granted"
        );
        Ok(())
    }

    fn reject(&self, capability: &str, err: &AdmissionError) {
        match err {
            AdmissionError::PayloadTooLarge { .. } | AdmissionError::InvalidStructure { .. } => {
                self.metrics.incr(
                    VALIDATION_FAILURES_TOTAL,
                    &[("code", err.code().as_str())],
                );
            }
            AdmissionError::PermissionDenied { .. } => {
                self.metrics
                    .incr(PERMISSION_DENIALS_TOTAL, &[("tool", capability)]);
            }
            AdmissionError::RateLimited { .. } => {
                self.metrics
                    .incr(RATE_LIMIT_REJECTIONS_TOTAL, &[("tool", capability)]);
            }
        }
        tracing::debug!(capability, code = %err.code(), "admission rejected");
    }
}
