use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::Config;

/// Issues a socket URL that embeds a fresh, time-limited credential.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn issue(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    client_secret: Option<ClientSecret>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

/// Asks an HTTP token endpoint for a credential.
pub struct HttpCredentialProvider {
    client: Client,
    token_url: String,
    ws_url: String,
    api_key: Option<String>,
    model: String,
    voice: String,
}

impl HttpCredentialProvider {
    /// `None` when no token endpoint is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if config.network.token_url.is_empty() {
            return Ok(None);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Some(Self {
            client,
            token_url: config.network.token_url.clone(),
            ws_url: config.network.ws_url.clone(),
            api_key: config.network.api_key().map(str::to_owned),
            model: config.network.model.clone(),
            voice: config.session.voice.clone(),
        }))
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn issue(&self) -> Result<String> {
        let body = json!({
            "model": self.model,
            "voice": self.voice,
        });

        let mut request = self.client.post(&self.token_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.context("Token request failed")?;
        if !resp.status().is_success() {
            bail!("Token endpoint returned HTTP {}", resp.status());
        }
        let token: TokenResponse = resp.json().await.context("Token response is not valid JSON")?;

        if let Some(secret) = &token.client_secret {
            if let Some(expires_at) = secret.expires_at {
                log::debug!("Credential expires at {}", expires_at);
            }
        }
        resolve_socket_url(&self.ws_url, token)
    }
}

fn resolve_socket_url(ws_url: &str, token: TokenResponse) -> Result<String> {
    if let Some(url) = token.url {
        return Ok(url);
    }
    let secret = token
        .token
        .or(token.client_secret.map(|s| s.value))
        .ok_or_else(|| anyhow!("Token response carries neither url nor token"))?;
    embed_token(ws_url, &secret)
}

/// Put `token` into the `token` query parameter of `ws_url`, replacing any
/// previous one.
pub fn embed_token(ws_url: &str, token: &str) -> Result<String> {
    let mut url = Url::parse(ws_url).with_context(|| format!("Invalid socket URL {}", ws_url))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("token", token);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> TokenResponse {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn embeds_token_keeping_other_params() {
        let url = embed_token("wss://service.test/v1/realtime?model=m&token=old", "abc").unwrap();
        assert_eq!(url, "wss://service.test/v1/realtime?model=m&token=abc");
    }

    #[test]
    fn prefers_explicit_url() {
        let token = parse(r#"{"url":"wss://direct.test/s?token=t","token":"ignored"}"#);
        assert_eq!(
            resolve_socket_url("wss://service.test/v1/realtime", token).unwrap(),
            "wss://direct.test/s?token=t"
        );
    }

    #[test]
    fn falls_back_to_client_secret() {
        let token = parse(r#"{"client_secret":{"value":"ek_1","expires_at":1700000000}}"#);
        assert_eq!(
            resolve_socket_url("wss://service.test/v1/realtime", token).unwrap(),
            "wss://service.test/v1/realtime?token=ek_1"
        );
    }

    #[test]
    fn empty_response_is_an_error() {
        assert!(resolve_socket_url("wss://service.test/", parse("{}")).is_err());
    }

    #[test]
    fn no_provider_without_token_url() {
        assert!(HttpCredentialProvider::from_config(&Config::default()).unwrap().is_none());
    }
}
