//! Authorization providers and code exchange

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use super::events::ProviderTokens;
use crate::{Error, Result};

/// An OAuth-style authorization provider
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    /// Path segment identifying the provider (e.g. `spotify`)
    pub name: String,

    /// Authorization endpoint the user is redirected to
    pub authorize_url: String,

    /// Token endpoint for the code exchange
    pub token_url: String,

    /// OAuth client ID
    pub client_id: String,

    /// OAuth client secret
    #[serde(deserialize_with = "deserialize_secret")]
    pub client_secret: SecretString,

    /// Callback URL registered with the provider
    pub redirect_uri: String,

    /// Scopes to request
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Extra authorization query parameters (e.g. `access_type = "offline"`)
    #[serde(default)]
    pub authorize_params: BTreeMap<String, String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    /// Build the authorization URL carrying `state`
    ///
    /// # Errors
    ///
    /// Returns error if `authorize_url` is not a valid URL
    pub fn authorization_url(&self, state: &str) -> Result<Url> {
        let mut url = Url::parse(&self.authorize_url).map_err(|e| {
            Error::Config(format!("provider {}: invalid authorize_url: {e}", self.name))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("state", state);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
            for (key, value) in &self.authorize_params {
                query.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secret = String::deserialize(deserializer)?;
    Ok(SecretString::from(secret))
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: Vec<ProviderConfig>,
}

/// Load provider declarations from a TOML file
///
/// A missing file means no providers are configured.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed, or declares a name twice
pub fn load_providers(path: &Path) -> Result<Vec<ProviderConfig>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no providers file");
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)?;
    parse_providers(&content)
}

/// Parse provider declarations from TOML text
///
/// # Errors
///
/// Returns error if the TOML is invalid or declares a name twice
pub fn parse_providers(content: &str) -> Result<Vec<ProviderConfig>> {
    let file: ProvidersFile = toml::from_str(content)?;

    let mut seen = std::collections::HashSet::new();
    for provider in &file.providers {
        if provider.name.is_empty() {
            return Err(Error::Config("provider with empty name".to_string()));
        }
        if !seen.insert(provider.name.as_str()) {
            return Err(Error::Config(format!("duplicate provider: {}", provider.name)));
        }
    }

    Ok(file.providers)
}

/// Exchanges an authorization code for provider credentials
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Redeem `code` at the provider's token endpoint
    async fn exchange(&self, provider: &ProviderConfig, code: &str) -> Result<ProviderTokens>;
}

/// Token exchange over HTTP
#[derive(Clone, Default)]
pub struct OAuthClient {
    client: reqwest::Client,
}

#[async_trait]
impl TokenExchange for OAuthClient {
    async fn exchange(&self, provider: &ProviderConfig, code: &str) -> Result<ProviderTokens> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", provider.redirect_uri.as_str()),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.expose_secret()),
        ];

        let response = self
            .client
            .post(&provider.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider = %provider.name, %status, "token exchange rejected");
            return Err(Error::Provider(format!("token endpoint returned {status}: {body}")));
        }

        response
            .json::<ProviderTokens>()
            .await
            .map_err(|e| Error::Provider(format!("invalid token response: {e}")))
    }
}
