//! Scope-based authorization for capability invocation.
//!
//! Capabilities declare a required scope in a static table built at startup.
//! A caller's grant set is opaque to the runtime; it either contains the
//! required scope exactly or a wildcard `prefix.*` grant whose prefix covers
//! it. Capabilities absent from the table require no scope; unregistered
//! tools are rejected elsewhere, before authorization matters.

use std::collections::HashMap;

use crate::error::AdmissionError;

/// Static capability-name to required-scope table.
#[derive(Debug, Clone, Default)]
pub struct ScopeAuthorizer {
    required: HashMap<String, String>,
}

impl ScopeAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `capability` requires `scope`.
    pub fn require(mut self, capability: impl Into<String>, scope: impl Into<String>) -> Self {
        self.required.insert(capability.into(), scope.into());
        self
    }

    /// The scope required for a capability, if any.
    pub fn required_scope(&self, capability: &str) -> Option<&str> {
        self.required.get(capability).map(String::as_str)
    }

    /// Check a caller's grant set against the capability's required scope.
    pub fn authorize(
        &self,
        capability: &str,
        caller_scopes: &[String],
    ) -> Result<(), AdmissionError> {
        let required = match self.required.get(capability) {
            Some(scope) => scope,
            None => return Ok(()),
        };
        if caller_scopes
            .iter()
            .any(|granted| scope_matches(granted, required))
        {
            Ok(())
        } else {
            Err(AdmissionError::PermissionDenied {
                capability: capability.to_string(),
                missing_scope: required.clone(),
            })
        }
    }
}

/// Whether a single granted scope satisfies a required one.
///
/// Exact matches always satisfy. A wildcard grant `prefix.*` satisfies any
/// required scope of the form `prefix.<suffix>`; it does not satisfy the bare
/// prefix itself or scopes that merely share leading characters.
pub fn scope_matches(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(".*") {
        return required
            .strip_prefix(prefix)
            .map_or(false, |rest| rest.starts_with('.') && rest.len() > 1);
    }
    false
}
