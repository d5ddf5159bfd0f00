//! Instance registration: the permanent/temporary token handoff
//!
//! A registering instance never receives its long-lived token over HTTP.
//! Instead the registrar:
//!
//! 1. Validates the requested policies
//! 2. Mints the permanent token (requested policies, no parent, 72h)
//! 3. Mints a temporary token (default policy only, 15s, 2 uses)
//! 4. Writes the permanent token's full response into the temporary token's
//!    cubbyhole at `cubbyhole/perm`, authenticated as the temporary token
//! 5. Returns only the temporary token
//!
//! The instance then logs in with the temporary token and reads its
//! cubbyhole. Every Vault call is made at most once; nothing is retried.
//! If anything fails after the permanent token exists, it is revoked before
//! the error is returned.

pub mod request;

use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::vault::{ClientToken, Secret, SecretBackend, TokenCreateRequest, VaultError};

pub use request::{RegistrationRequest, RegistrationResult, ValidationError, RESERVED_POLICY};

/// Cubbyhole path the permanent token is written to
pub const HANDOFF_PATH: &str = "cubbyhole/perm";

/// Lease on the permanent token
pub const PERM_TOKEN_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// Lease on the temporary token
pub const TEMP_TOKEN_TTL: Duration = Duration::from_secs(15);

/// Use budget on the temporary token.
///
/// The instance spends one use authenticating with the token and one reading
/// `cubbyhole/perm`. Anything below 2 leaves the cubbyhole unreadable. If the
/// client side ever re-authenticates before reading, this has to grow with it.
pub const TEMP_TOKEN_NUM_USES: u32 = 2;

/// Errors returned by [`Registrar::register`]
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Vault detail is logged where it happens, not carried here
    #[error("unable to create token")]
    Backend,
}

/// How far a registration got.
///
/// Each stage is logged once as `stage` when reached. On failure `stage`
/// names the stage that was not reached and `outcome` is `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStage {
    Received,
    Validated,
    PermMinted,
    TempMinted,
    Wrapped,
    Completed,
}

impl fmt::Display for RegistrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::PermMinted => "perm_minted",
            Self::TempMinted => "temp_minted",
            Self::Wrapped => "wrapped",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Issues and wraps instance tokens. Holds no per-request state.
#[derive(Clone)]
pub struct Registrar {
    backend: Arc<dyn SecretBackend>,
}

impl Registrar {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    /// Vault address instances should redeem their temporary token against
    pub fn vault_endpoint(&self) -> &str {
        self.backend.endpoint()
    }

    /// Register an instance and return its temporary token
    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResult, RegistrationError> {
        let span = info_span!(
            "register",
            request_id = %Uuid::new_v4(),
            remote_ip = %request.remote_addr,
            environment = %request.environment,
            provider = %request.provider,
            account = %request.account,
            region = %request.region,
            instance_id = %request.instance_id,
            role = %request.role,
        );
        self.handoff(request).instrument(span).await
    }

    async fn handoff(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResult, RegistrationError> {
        info!(stage = %RegistrationStage::Received, "Registering instance");

        if let Err(e) = request.validate() {
            warn!(
                stage = %RegistrationStage::Validated,
                outcome = "failed",
                reason = %e,
                "Registration rejected"
            );
            return Err(e.into());
        }
        debug!(stage = %RegistrationStage::Validated, "Request validated");

        let metadata = request.metadata();
        let perm_request = TokenCreateRequest {
            display_name: format!("perm instance {}", request.instance_path()),
            policies: request.policies.clone(),
            metadata: metadata.clone(),
            ttl: Some(PERM_TOKEN_TTL),
            no_parent: true,
            ..Default::default()
        };
        let perm = self
            .backend
            .create_token(&perm_request)
            .await
            .map_err(|e| backend_failure(RegistrationStage::PermMinted, "creating perm token", &e))?;
        let perm_token = perm.client_token().cloned().ok_or_else(|| {
            backend_failure(
                RegistrationStage::PermMinted,
                "creating perm token",
                &missing_auth(),
            )
        })?;
        debug!(stage = %RegistrationStage::PermMinted, "Perm token created");

        let temp_request = TokenCreateRequest {
            display_name: format!("temp instance {}", request.instance_path()),
            metadata,
            ttl: Some(TEMP_TOKEN_TTL),
            num_uses: TEMP_TOKEN_NUM_USES,
            ..Default::default()
        };

        match self.wrap(&perm, &temp_request).await {
            Ok(temp_token) => {
                info!(stage = %RegistrationStage::Completed, "Instance registered");
                Ok(RegistrationResult { temp_token })
            }
            Err(err) => {
                self.revoke_orphan(&perm_token).await;
                Err(err)
            }
        }
    }

    /// Mint the temporary token and park `perm` in its cubbyhole
    async fn wrap(
        &self,
        perm: &Secret,
        temp_request: &TokenCreateRequest,
    ) -> Result<ClientToken, RegistrationError> {
        let temp = self
            .backend
            .create_token(temp_request)
            .await
            .map_err(|e| backend_failure(RegistrationStage::TempMinted, "creating temp token", &e))?;
        let temp_token = temp.client_token().cloned().ok_or_else(|| {
            backend_failure(
                RegistrationStage::TempMinted,
                "creating temp token",
                &missing_auth(),
            )
        })?;
        debug!(stage = %RegistrationStage::TempMinted, "Temp token created");

        let scoped = self.backend.with_token(&temp_token);
        scoped
            .write(HANDOFF_PATH, &json!({ "payload": perm }))
            .await
            .map_err(|e| {
                backend_failure(
                    RegistrationStage::Wrapped,
                    "writing perm token to cubbyhole",
                    &e,
                )
            })?;
        debug!(stage = %RegistrationStage::Wrapped, "Perm token written to {}", HANDOFF_PATH);

        Ok(temp_token)
    }

    /// Best effort; the registration has already failed either way
    async fn revoke_orphan(&self, perm_token: &ClientToken) {
        match self.backend.revoke_token(perm_token).await {
            Ok(()) => info!("Revoked orphaned perm token"),
            Err(e) => error!(error = %e, "Failed to revoke orphaned perm token"),
        }
    }
}

fn missing_auth() -> VaultError {
    VaultError::Decode("token create response has no client token".to_string())
}

/// `stage` names the stage that was not reached
fn backend_failure(stage: RegistrationStage, action: &str, err: &VaultError) -> RegistrationError {
    error!(stage = %stage, outcome = "failed", error = %err, "Error {}", action);
    RegistrationError::Backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::SecretAuth;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    const BOOTSTRAP: &str = "bootstrap-token";
    const PERM: &str = "generated-perm-token";
    const TEMP: &str = "generated-temp-token";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        CreateToken(TokenCreateRequest),
        WithToken(String),
        Write {
            as_token: String,
            path: String,
            data: Value,
        },
        Revoke {
            as_token: String,
            token: String,
        },
    }

    #[derive(Default)]
    struct Script {
        calls: Vec<Call>,
        create_results: VecDeque<Result<Secret, VaultError>>,
        fail_write: bool,
        fail_revoke: bool,
    }

    /// Records every call; clients derived with `with_token` share the log
    struct MockBackend {
        token: String,
        script: Arc<Mutex<Script>>,
    }

    impl MockBackend {
        fn new(script: Script) -> (Arc<Self>, Arc<Mutex<Script>>) {
            let script = Arc::new(Mutex::new(script));
            let backend = Arc::new(Self {
                token: BOOTSTRAP.to_string(),
                script: Arc::clone(&script),
            });
            (backend, script)
        }

        fn record(&self, call: Call) {
            self.script.lock().unwrap().calls.push(call);
        }
    }

    #[async_trait::async_trait]
    impl SecretBackend for MockBackend {
        fn endpoint(&self) -> &str {
            "https://vault.example.com/"
        }

        fn with_token(&self, token: &ClientToken) -> Arc<dyn SecretBackend> {
            self.record(Call::WithToken(token.expose().to_string()));
            Arc::new(MockBackend {
                token: token.expose().to_string(),
                script: Arc::clone(&self.script),
            })
        }

        async fn create_token(&self, request: &TokenCreateRequest) -> Result<Secret, VaultError> {
            self.record(Call::CreateToken(request.clone()));
            self.script
                .lock()
                .unwrap()
                .create_results
                .pop_front()
                .expect("unexpected create_token call")
        }

        async fn write(&self, path: &str, data: &Value) -> Result<Option<Secret>, VaultError> {
            self.record(Call::Write {
                as_token: self.token.clone(),
                path: path.to_string(),
                data: data.clone(),
            });
            if self.script.lock().unwrap().fail_write {
                return Err(VaultError::Status {
                    status: 403,
                    errors: vec!["permission denied".to_string()],
                });
            }
            Ok(None)
        }

        async fn revoke_token(&self, token: &ClientToken) -> Result<(), VaultError> {
            self.record(Call::Revoke {
                as_token: self.token.clone(),
                token: token.expose().to_string(),
            });
            if self.script.lock().unwrap().fail_revoke {
                return Err(VaultError::Request("connection reset".to_string()));
            }
            Ok(())
        }
    }

    fn token_secret(token: &str, policies: &[&str]) -> Secret {
        Secret {
            auth: Some(SecretAuth {
                client_token: ClientToken::new(token),
                policies: policies.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn request(policies: &[&str]) -> RegistrationRequest {
        RegistrationRequest {
            environment: "dev".to_string(),
            provider: "aws".to_string(),
            account: "gen".to_string(),
            region: "us-east-1".to_string(),
            instance_id: "i-04c9c4c4".to_string(),
            role: "cluster-server".to_string(),
            policies: policies.iter().map(|p| p.to_string()).collect(),
            remote_addr: "10.1.2.3".to_string(),
        }
    }

    fn happy_script() -> Script {
        Script {
            create_results: VecDeque::from([
                Ok(token_secret(PERM, &["instance-management"])),
                Ok(token_secret(TEMP, &[])),
            ]),
            ..Default::default()
        }
    }

    fn calls(script: &Arc<Mutex<Script>>) -> Vec<Call> {
        script.lock().unwrap().calls.clone()
    }

    #[tokio::test]
    async fn test_registers_instance_in_aws() {
        let (backend, script) = MockBackend::new(happy_script());
        let registrar = Registrar::new(backend);

        let result = assert_ok!(registrar.register(&request(&["instance-management"])).await);
        assert_eq!(result.temp_token.expose(), TEMP);

        let calls = calls(&script);
        assert_eq!(calls.len(), 4);

        let expected_meta = request(&[]).metadata();
        assert_eq!(
            calls[0],
            Call::CreateToken(TokenCreateRequest {
                display_name: "perm instance dev/aws/gen/us-east-1/i-04c9c4c4".to_string(),
                policies: vec!["instance-management".to_string()],
                metadata: expected_meta.clone(),
                ttl: Some(Duration::from_secs(72 * 3600)),
                num_uses: 0,
                no_parent: true,
            })
        );
        assert_eq!(
            calls[1],
            Call::CreateToken(TokenCreateRequest {
                display_name: "temp instance dev/aws/gen/us-east-1/i-04c9c4c4".to_string(),
                policies: vec![],
                metadata: expected_meta,
                ttl: Some(Duration::from_secs(15)),
                num_uses: 2,
                no_parent: false,
            })
        );
        assert_eq!(calls[2], Call::WithToken(TEMP.to_string()));

        match &calls[3] {
            Call::Write {
                as_token,
                path,
                data,
            } => {
                assert_eq!(as_token, TEMP);
                assert_eq!(path, "cubbyhole/perm");
                assert_eq!(data["payload"]["auth"]["client_token"], PERM);
                assert_eq!(data["payload"]["auth"]["policies"][0], "instance-management");
            }
            other => panic!("expected cubbyhole write, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_never_contains_perm_token() {
        let (backend, _script) = MockBackend::new(happy_script());
        let result = Registrar::new(backend)
            .register(&request(&["instance-management"]))
            .await
            .unwrap();

        assert_ne!(result.temp_token.expose(), PERM);
        assert!(!format!("{:?}", result).contains(PERM));
    }

    #[tokio::test]
    async fn test_no_policies_makes_no_backend_calls() {
        let (backend, script) = MockBackend::new(Script::default());
        let err = assert_err!(Registrar::new(backend).register(&request(&[])).await);

        assert!(matches!(
            err,
            RegistrationError::Validation(ValidationError::NoPolicies)
        ));
        assert_eq!(err.to_string(), "no policies specified");
        assert!(calls(&script).is_empty());
    }

    #[tokio::test]
    async fn test_root_policy_makes_no_backend_calls() {
        let (backend, script) = MockBackend::new(Script::default());
        let err = assert_err!(Registrar::new(backend).register(&request(&["root"])).await);

        assert_eq!(err.to_string(), "illegal policy");
        assert!(calls(&script).is_empty());
    }

    #[tokio::test]
    async fn test_perm_failure_stops_immediately() {
        let (backend, script) = MockBackend::new(Script {
            create_results: VecDeque::from([Err(VaultError::Status {
                status: 500,
                errors: vec!["internal error, storage at 10.9.9.9".to_string()],
            })]),
            ..Default::default()
        });

        let err = assert_err!(
            Registrar::new(backend)
                .register(&request(&["instance-management"]))
                .await
        );
        assert!(matches!(err, RegistrationError::Backend));
        assert_eq!(err.to_string(), "unable to create token");

        let calls = calls(&script);
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::CreateToken(_)));
    }

    #[tokio::test]
    async fn test_temp_failure_skips_write_and_revokes_perm() {
        let (backend, script) = MockBackend::new(Script {
            create_results: VecDeque::from([
                Ok(token_secret(PERM, &["instance-management"])),
                Err(VaultError::Request("timed out".to_string())),
            ]),
            ..Default::default()
        });

        let err = assert_err!(
            Registrar::new(backend)
                .register(&request(&["instance-management"]))
                .await
        );
        assert!(matches!(err, RegistrationError::Backend));

        let calls = calls(&script);
        assert!(!calls.iter().any(|c| matches!(c, Call::Write { .. })));
        assert_eq!(
            calls.last(),
            Some(&Call::Revoke {
                as_token: BOOTSTRAP.to_string(),
                token: PERM.to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_surfaced_and_perm_revoked() {
        let mut script = happy_script();
        script.fail_write = true;
        let (backend, script) = MockBackend::new(script);

        let err = assert_err!(
            Registrar::new(backend)
                .register(&request(&["instance-management"]))
                .await
        );
        assert!(matches!(err, RegistrationError::Backend));

        let calls = calls(&script);
        assert_eq!(calls.len(), 5);
        assert!(matches!(calls[3], Call::Write { .. }));
        assert_eq!(
            calls[4],
            Call::Revoke {
                as_token: BOOTSTRAP.to_string(),
                token: PERM.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_revoke_failure_keeps_original_error() {
        let mut script = happy_script();
        script.fail_write = true;
        script.fail_revoke = true;
        let (backend, _script) = MockBackend::new(script);

        let err = assert_err!(
            Registrar::new(backend)
                .register(&request(&["instance-management"]))
                .await
        );
        assert!(matches!(err, RegistrationError::Backend));
    }

    #[tokio::test]
    async fn test_perm_response_without_token_is_backend_error() {
        let (backend, script) = MockBackend::new(Script {
            create_results: VecDeque::from([Ok(Secret::default())]),
            ..Default::default()
        });

        let err = assert_err!(
            Registrar::new(backend)
                .register(&request(&["instance-management"]))
                .await
        );
        assert!(matches!(err, RegistrationError::Backend));
        assert_eq!(calls(&script).len(), 1);
    }

    #[tokio::test]
    async fn test_each_registration_mints_fresh_tokens() {
        let (backend, script) = MockBackend::new(Script {
            create_results: VecDeque::from([
                Ok(token_secret("perm-1", &[])),
                Ok(token_secret("temp-1", &[])),
                Ok(token_secret("perm-2", &[])),
                Ok(token_secret("temp-2", &[])),
            ]),
            ..Default::default()
        });
        let registrar = Registrar::new(backend);

        let first = registrar.register(&request(&["a"])).await.unwrap();
        let second = registrar.register(&request(&["a"])).await.unwrap();
        assert_eq!(first.temp_token.expose(), "temp-1");
        assert_eq!(second.temp_token.expose(), "temp-2");

        let creates = calls(&script)
            .into_iter()
            .filter(|c| matches!(c, Call::CreateToken(_)))
            .count();
        assert_eq!(creates, 4);
    }

    /// Collects formatted log output for the current thread
    fn capture_logs() -> (Arc<Mutex<Vec<u8>>>, tracing::subscriber::DefaultGuard) {
        struct Sink(Arc<Mutex<Vec<u8>>>);

        impl std::io::Write for Sink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&buf);
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || Sink(Arc::clone(&writer)))
            .finish();
        (buf, tracing::subscriber::set_default(subscriber))
    }

    fn log_lines(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<String> {
        String::from_utf8(buf.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_every_stage_is_logged_once_in_order() {
        let (buf, _guard) = capture_logs();
        let (backend, _) = MockBackend::new(happy_script());
        assert_ok!(
            Registrar::new(backend)
                .register(&request(&["instance-management"]))
                .await
        );

        let lines = log_lines(&buf);
        let stages: Vec<&str> = [
            "received",
            "validated",
            "perm_minted",
            "temp_minted",
            "wrapped",
            "completed",
        ]
        .to_vec();
        let mut positions = Vec::new();
        for stage in &stages {
            let needle = format!("stage={}", stage);
            let hits: Vec<usize> = lines
                .iter()
                .enumerate()
                .filter(|(_, l)| l.contains(&needle))
                .map(|(i, _)| i)
                .collect();
            assert_eq!(hits.len(), 1, "{} logged {} times", stage, hits.len());
            positions.push(hits[0]);
        }
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(lines.iter().all(|l| !l.contains("failed_at")));
    }

    #[tokio::test]
    async fn test_failure_names_the_stage_not_reached() {
        let (buf, _guard) = capture_logs();
        let (backend, _) = MockBackend::new(Script {
            create_results: VecDeque::from([
                Ok(token_secret(PERM, &["instance-management"])),
                Err(VaultError::Request("connection reset".to_string())),
            ]),
            ..Default::default()
        });
        assert_err!(
            Registrar::new(backend)
                .register(&request(&["instance-management"]))
                .await
        );

        let lines = log_lines(&buf);
        let failure: Vec<&String> = lines.iter().filter(|l| l.contains("ERROR")).collect();
        assert!(!failure.is_empty());
        assert!(failure[0].contains("stage=temp_minted"));
        assert!(failure[0].contains("failed"));
        assert!(lines.iter().any(|l| l.contains("stage=perm_minted") && !l.contains("ERROR")));
        assert!(lines.iter().all(|l| !l.contains("stage=completed")));
    }

    #[test]
    fn test_temp_budget_covers_login_and_read() {
        assert!(TEMP_TOKEN_NUM_USES >= 2);
        assert!(TEMP_TOKEN_TTL < PERM_TOKEN_TTL);
    }

    #[test]
    fn test_vault_endpoint_passthrough() {
        let (backend, _) = MockBackend::new(Script::default());
        assert_eq!(
            Registrar::new(backend).vault_endpoint(),
            "https://vault.example.com/"
        );
    }
}
