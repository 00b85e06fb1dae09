use crate::run::RunContext;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Credential '{name}' unavailable: {message}")]
    Unavailable { name: String, message: String },
}

/// Resolves credential names to decrypted credential data.
///
/// Lookups are synchronous so they can be served from inside expression
/// evaluation; implementations are expected to answer from a cache.
pub trait CredentialProvider: Send + Sync {
    fn resolve_credential(&self, name: &str, ctx: &RunContext) -> Result<Value, CredentialError>;
}

/// Provider with no credentials; every lookup fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn resolve_credential(&self, name: &str, _ctx: &RunContext) -> Result<Value, CredentialError> {
        Err(CredentialError::NotFound(name.to_string()))
    }
}

/// Fixed in-memory credential set
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, Value>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, data: Value) -> Self {
        self.entries.insert(name.into(), data);
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve_credential(&self, name: &str, _ctx: &RunContext) -> Result<Value, CredentialError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(name.to_string()))
    }
}
