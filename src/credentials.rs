//! Bearer credential provider interface

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;

/// Supplies the bearer token used by both transports
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current token, if any
    async fn current_token(&self) -> Option<String>;

    /// Obtain a fresh token
    async fn refresh(&self) -> Result<()>;
}

/// A fixed token, optionally re-read from an environment variable on refresh
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
    refresh_env: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: RwLock::new(if token.is_empty() { None } else { Some(token) }),
            refresh_env: None,
        }
    }

    /// No token at all; every dispatch fails with `NotAuthenticated`
    pub fn anonymous() -> Self {
        Self {
            token: RwLock::new(None),
            refresh_env: None,
        }
    }

    /// Re-read the token from `var` whenever a refresh is requested
    pub fn with_refresh_env(mut self, var: impl Into<String>) -> Self {
        self.refresh_env = Some(var.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current_token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn refresh(&self) -> Result<()> {
        let var = self
            .refresh_env
            .as_deref()
            .ok_or_else(|| anyhow!("static credential cannot be refreshed"))?;

        let value = std::env::var(var).map_err(|_| anyhow!("{} is not set", var))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("{} is empty", var));
        }

        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(value.to_string());
        info!("Credential refreshed from {}", var);
        Ok(())
    }
}
