//! Login flows against the artifact service.
//!
//! Two flows exist: OAuth2 device-code (with refresh) against the identity
//! provider, and public-key challenge signing against the service itself.
//! Both persist their results into the user settings store.

use crate::store::{OAuthTokens, PubkeyCache, SettingsStore, OAUTH_KEY, PUBKEY_KEY};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{Error, Result};
use dyn_clone::{clone_trait_object, DynClone};
use log::{debug, warn};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding},
    signature::{SignatureEncoding, Signer},
    RsaPrivateKey,
};
use sha2::Sha256;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

/// Scopes requested by the device-code flow.
pub const DEVICE_CODE_SCOPE: &str = "email profile User.Read openid";

/// The stable message signed by the public-key flow.
pub const LOGIN_MESSAGE: &[u8] = b"containerv-artifact-login-v1";

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    user_code: String,
    device_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accountId")]
    account_id: String,
    token: String,
}

#[async_trait]
/// Form-POST transport; mockable for tests.
pub trait AuthHttp: DynClone + Send + Sync {
    /// POST a form body and return the status code with the response text.
    async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<(u16, String)>;

    /// POST a JSON body and return the status code with the response text.
    async fn post_json(&self, url: &str, body: String) -> Result<(u16, String)>;
}

clone_trait_object!(AuthHttp);

#[derive(Clone, Debug, Default)]
/// The production HTTP transport.
pub struct HttpAuthTransport {
    client: reqwest::Client,
}

#[async_trait]
impl AuthHttp for HttpAuthTransport {
    async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<(u16, String)> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::io(format!("post {}: {}", url, e)))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::io(format!("read response from {}: {}", url, e)))?;
        Ok((status, text))
    }

    async fn post_json(&self, url: &str, body: String) -> Result<(u16, String)> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::io(format!("post {}: {}", url, e)))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::io(format!("read response from {}: {}", url, e)))?;
        Ok((status, text))
    }
}

#[async_trait]
/// Poll pacing; mockable so tests can observe the sleep sequence.
pub trait Delay: DynClone + Send + Sync {
    async fn sleep(&self, seconds: u64);
}

clone_trait_object!(Delay);

#[derive(Clone, Debug, Default)]
struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn sleep(&self, seconds: u64) {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }
}

/// The OAuth2 device-code flow.
pub struct DeviceCodeFlow {
    auth_base: String,
    client_id: String,
    http: Box<dyn AuthHttp>,
    delay: Box<dyn Delay>,
}

impl DeviceCodeFlow {
    pub fn new<A: Into<String>, C: Into<String>>(auth_base: A, client_id: C) -> Self {
        Self {
            auth_base: auth_base.into(),
            client_id: client_id.into(),
            http: Box::new(HttpAuthTransport::default()),
            delay: Box::new(TokioDelay),
        }
    }

    /// Replace the transports; used by tests.
    pub fn with_transports(mut self, http: Box<dyn AuthHttp>, delay: Box<dyn Delay>) -> Self {
        self.http = http;
        self.delay = delay;
        self
    }

    /// Log in: refresh when possible, otherwise run the device-code
    /// challenge. The resulting tokens are persisted under `oauth`.
    pub async fn login(&self, store: &mut SettingsStore) -> Result<OAuthTokens> {
        if let Some(existing) = store.get::<OAuthTokens>(OAUTH_KEY)? {
            if let Some(refresh_token) = existing.refresh_token.as_deref() {
                match self.refresh(refresh_token).await {
                    Ok(tokens) => {
                        store.insert(OAUTH_KEY, &tokens)?;
                        store.persist()?;
                        return Ok(tokens);
                    }
                    Err(e) => {
                        debug!("Refresh grant failed, falling back to device code: {}", e)
                    }
                }
            }
        }

        let tokens = self.device_code_challenge().await?;
        store.insert(OAUTH_KEY, &tokens)?;
        store.persist()?;
        Ok(tokens)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        let (status, body) = self
            .http
            .post_form(
                &format!("{}/oauth2/v2.0/token", self.auth_base),
                &[
                    ("client_id", self.client_id.clone()),
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token.to_string()),
                    ("scope", DEVICE_CODE_SCOPE.to_string()),
                ],
            )
            .await?;
        if status / 100 != 2 {
            return Err(Error::denied(format!("refresh grant returned {}", status)));
        }
        parse_tokens(&body)
    }

    async fn device_code_challenge(&self) -> Result<OAuthTokens> {
        let (status, body) = self
            .http
            .post_form(
                &format!("{}/oauth2/v2.0/devicecode", self.auth_base),
                &[
                    ("client_id", self.client_id.clone()),
                    ("scope", DEVICE_CODE_SCOPE.to_string()),
                ],
            )
            .await?;
        if status / 100 != 2 {
            return Err(Error::io(format!("device code request returned {}", status)));
        }
        let challenge: DeviceCodeResponse = serde_json::from_str(&body)
            .map_err(|e| Error::protocol(format!("device code response: {}", e)))?;

        println!(
            "To sign in, use a web browser to open the page {} and enter the code {} to authenticate.",
            challenge.verification_uri, challenge.user_code
        );

        let mut interval = challenge.interval;
        let mut elapsed = 0u64;
        loop {
            let (status, body) = self
                .http
                .post_form(
                    &format!("{}/oauth2/v2.0/token", self.auth_base),
                    &[
                        ("client_id", self.client_id.clone()),
                        (
                            "grant_type",
                            "urn:ietf:params:oauth:grant-type:device_code".to_string(),
                        ),
                        ("device_code", challenge.device_code.clone()),
                    ],
                )
                .await?;

            if status / 100 == 2 {
                return parse_tokens(&body);
            }

            let error: TokenError = serde_json::from_str(&body)
                .map_err(|e| Error::protocol(format!("token error response: {}", e)))?;
            match error.error.as_str() {
                "authorization_pending" => {
                    self.delay.sleep(interval).await;
                    elapsed += interval;
                }
                "slow_down" => {
                    self.delay.sleep(interval).await;
                    elapsed += interval;
                    interval += 5;
                }
                other => {
                    return Err(Error::denied(format!("device code flow failed: {}", other)))
                }
            }

            if elapsed >= challenge.expires_in {
                return Err(Error::timeout("device code expired before authorization"));
            }
        }
    }
}

fn parse_tokens(body: &str) -> Result<OAuthTokens> {
    let tokens: TokenResponse = serde_json::from_str(body)
        .map_err(|e| Error::protocol(format!("token response: {}", e)))?;
    Ok(OAuthTokens {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        id_token: tokens.id_token,
    })
}

/// The public-key challenge-signing flow.
pub struct PublicKeyFlow {
    api_base: String,
    key_path: PathBuf,
    http: Box<dyn AuthHttp>,
}

impl PublicKeyFlow {
    pub fn new<A: Into<String>, P: Into<PathBuf>>(api_base: A, key_path: P) -> Self {
        Self {
            api_base: api_base.into(),
            key_path: key_path.into(),
            http: Box::new(HttpAuthTransport::default()),
        }
    }

    /// Replace the transport; used by tests.
    pub fn with_transport(mut self, http: Box<dyn AuthHttp>) -> Self {
        self.http = http;
        self
    }

    /// The bearer token for service calls: the cached JWT when present,
    /// otherwise a fresh signed login. Callers that observe a 401 should
    /// call [`Self::relogin`] once and retry.
    pub async fn bearer(&self, store: &mut SettingsStore) -> Result<String> {
        if let Some(cached) = store.get::<PubkeyCache>(PUBKEY_KEY)? {
            return Ok(cached.jwt_token);
        }
        self.relogin(store).await
    }

    /// Re-sign the login message and post it, replacing the cached JWT.
    pub async fn relogin(&self, store: &mut SettingsStore) -> Result<String> {
        let key = self.read_key()?;
        let signing_key = SigningKey::<Sha256>::new(key.clone());
        let signature = signing_key.sign(LOGIN_MESSAGE);

        let public_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::invalid(format!("encode public key: {}", e)))?;

        let body = serde_json::json!({
            "PublicKey": public_pem,
            "SecurityToken": BASE64.encode(signature.to_bytes()),
        })
        .to_string();

        let (status, text) = self
            .http
            .post_json(&format!("{}/login", self.api_base), body)
            .await?;
        if status == 401 {
            return Err(Error::denied("login signature rejected"));
        }
        if status / 100 != 2 {
            return Err(Error::io(format!("login returned {}", status)));
        }

        let response: LoginResponse = serde_json::from_str(&text)
            .map_err(|e| Error::protocol(format!("login response: {}", e)))?;
        let cache = PubkeyCache {
            account_guid: response.account_id,
            jwt_token: response.token,
        };
        store.insert(PUBKEY_KEY, &cache)?;
        if let Err(e) = store.persist() {
            warn!("Persisting pubkey cache failed: {}", e);
        }
        Ok(cache.jwt_token)
    }

    fn read_key(&self) -> Result<RsaPrivateKey> {
        let pem = std::fs::read_to_string(&self.key_path)
            .map_err(|e| Error::from_io(format!("read {}", self.key_path.display()), e))?;
        RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| Error::invalid(format!("parse private key: {}", e)))
    }
}
