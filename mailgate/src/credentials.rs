//! API key issuance and lookup.
//!
//! Raw key material is `sk_` followed by 64 hex characters (32 random bytes).
//! Only its SHA-256 hex digest is stored; the raw value is handed back once,
//! from [`CredentialStore::create`].

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::{ApiKey, ApiKeyPatch, TenantId};
use crate::store::{ApiKeyRepository, StoreError};

/// Prefix identifying gateway secret keys.
pub const API_KEY_PREFIX: &str = "sk_";

/// Length of the displayable key prefix stored alongside the hash.
const DISPLAY_PREFIX_LEN: usize = 8;

/// The identity an admitted request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub tenant_id: TenantId,
    pub api_key_id: Uuid,
    pub rate_limit_per_hour: u32,
    pub key_prefix: String,
}

/// Generate fresh raw key material.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", API_KEY_PREFIX, hex::encode(bytes))
}

/// One-way hash used to look keys up.
pub fn hash_api_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

#[derive(Clone)]
pub struct CredentialStore {
    keys: Arc<dyn ApiKeyRepository>,
}

impl CredentialStore {
    pub fn new(keys: Arc<dyn ApiKeyRepository>) -> Self {
        Self { keys }
    }

    /// Issue a new key. The returned raw key is never retrievable again.
    pub async fn create(
        &self,
        tenant_id: TenantId,
        name: &str,
        rate_limit_per_hour: u32,
    ) -> Result<(ApiKey, String), GatewayError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::validation("name is required"));
        }
        if rate_limit_per_hour == 0 {
            return Err(GatewayError::validation("rate_limit must be at least 1"));
        }

        let raw = generate_api_key();
        let key = ApiKey {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            key_hash: hash_api_key(&raw),
            key_prefix: raw[..DISPLAY_PREFIX_LEN].to_string(),
            rate_limit_per_hour,
            last_used_at: None,
            created_at: Utc::now(),
            deleted_at: None,
        };

        let key = self.keys.create(key).await?;
        info!(
            tenant_id = %tenant_id,
            api_key_id = %key.id,
            key_prefix = %key.key_prefix,
            rate_limit = rate_limit_per_hour,
            "api_key_created"
        );

        Ok((key, raw))
    }

    /// Resolve raw key material to the owning credential.
    pub async fn resolve(&self, raw: &str) -> Result<Option<Credential>, StoreError> {
        let key = self.keys.find_by_key_hash(&hash_api_key(raw)).await?;
        Ok(key.map(|k| Credential {
            tenant_id: k.tenant_id,
            api_key_id: k.id,
            rate_limit_per_hour: k.rate_limit_per_hour,
            key_prefix: k.key_prefix,
        }))
    }

    /// Record a successful admission. Failures are logged, not returned.
    pub async fn touch(&self, credential: &Credential) {
        let patch = ApiKeyPatch {
            last_used_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self
            .keys
            .update(credential.tenant_id, credential.api_key_id, patch)
            .await
        {
            warn!(
                error = %e,
                api_key_id = %credential.api_key_id,
                "api_key_touch_failed"
            );
        }
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<ApiKey>, GatewayError> {
        Ok(self.keys.find_by_tenant(tenant_id).await?)
    }

    /// Rename a key or change its quota.
    pub async fn update(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        name: Option<&str>,
        rate_limit_per_hour: Option<u32>,
    ) -> Result<ApiKey, GatewayError> {
        if rate_limit_per_hour == Some(0) {
            return Err(GatewayError::validation("rate_limit must be at least 1"));
        }
        let patch = ApiKeyPatch {
            name: name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            rate_limit_per_hour,
            last_used_at: None,
        };

        self.keys
            .update(tenant_id, id, patch)
            .await?
            .ok_or(GatewayError::NotFound("API key"))
    }

    /// Revoke a key. It stops resolving immediately.
    pub async fn revoke(&self, tenant_id: TenantId, id: Uuid) -> Result<(), GatewayError> {
        if self.keys.soft_delete(tenant_id, id).await? {
            info!(tenant_id = %tenant_id, api_key_id = %id, "api_key_revoked");
            Ok(())
        } else {
            Err(GatewayError::NotFound("API key"))
        }
    }
}
