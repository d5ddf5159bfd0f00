//! Registration request and result types

use std::collections::BTreeMap;

use crate::vault::ClientToken;

/// Policy that grants everything; never handed to an instance
pub const RESERVED_POLICY: &str = "root";

/// Rejected caller input. Messages are safe to return verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("no policies specified")]
    NoPolicies,

    #[error("illegal policy")]
    IllegalPolicy,
}

/// An instance asking to be registered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub environment: String,
    pub provider: String,
    pub account: String,
    pub region: String,
    pub instance_id: String,
    pub role: String,
    pub policies: Vec<String>,
    /// Caller origin, used for logging only
    pub remote_addr: String,
}

impl RegistrationRequest {
    /// Check the requested policy set.
    ///
    /// Tags are not checked here; Vault is the authority on what they mean.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.policies.is_empty() {
            return Err(ValidationError::NoPolicies);
        }
        if self.policies.iter().any(|p| p == RESERVED_POLICY) {
            return Err(ValidationError::IllegalPolicy);
        }
        Ok(())
    }

    /// `env/provider/account/region/instance-id`, the audit key
    pub fn instance_path(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.environment, self.provider, self.account, self.region, self.instance_id
        )
    }

    /// Token metadata attached to both minted tokens
    pub fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("environment".to_string(), self.environment.clone()),
            ("provider".to_string(), self.provider.clone()),
            ("account".to_string(), self.account.clone()),
            ("region".to_string(), self.region.clone()),
            ("instance_id".to_string(), self.instance_id.clone()),
            ("role".to_string(), self.role.clone()),
        ])
    }
}

/// What the caller gets back: the temporary token and nothing else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub temp_token: ClientToken,
}
