//! Account API: email/password login, registration, and logout.

use serde::{Deserialize, Serialize};
use tracing::info;
use vyx_config::{Config, ConfigError, CredentialError, CredentialStore};

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected request: {0}")]
    Api(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

#[derive(Debug, Serialize)]
struct CredentialsRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
}

async fn post_credentials(
    url: &str,
    email: &str,
    password: &str,
) -> Result<AuthResponse, AccountError> {
    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .json(&CredentialsRequest { email, password })
        .send()
        .await?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AccountError::Api(body));
    }

    Ok(response.json().await?)
}

/// Authenticate against the exchange API.
pub async fn login(
    api_base: &str,
    email: &str,
    password: &str,
) -> Result<AuthResponse, AccountError> {
    post_credentials(&format!("{api_base}/api/auth/login"), email, password).await
}

/// Create a new account.
pub async fn register(
    api_base: &str,
    email: &str,
    password: &str,
) -> Result<AuthResponse, AccountError> {
    post_credentials(&format!("{api_base}/api/auth/register"), email, password).await
}

/// Persist a successful auth response: token into the credential store,
/// identity into the config file.
pub fn persist_login(
    config: &mut Config,
    store: &dyn CredentialStore,
    response: &AuthResponse,
) -> Result<(), AccountError> {
    store.save_token(&response.user.id, &response.token)?;

    config.user_id = response.user.id.clone();
    config.email = response.user.email.clone();
    vyx_config::save_config(&vyx_config::config_path()?, config)?;

    info!(email = %config.email, "credentials saved");
    Ok(())
}

/// Delete the stored token and clear identity fields.
pub fn logout(config: &mut Config, store: &dyn CredentialStore) -> Result<(), AccountError> {
    if !config.user_id.is_empty() {
        store.delete_token(&config.user_id)?;
    }

    config.user_id.clear();
    config.email.clear();
    vyx_config::save_config(&vyx_config::config_path()?, config)?;

    info!("signed out");
    Ok(())
}
