//! HTTP(S) backend.
//!
//! `host/some/page:` resolves to `GET https://host/some/page`. The `:http`
//! and `:https` modifiers pick the scheme; writes are sent as `POST` and the
//! response body becomes what the writer reads back.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use librfs::{Backend, ControlFile};
use reqwest::header::USER_AGENT;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str = concat!("webrfs/", env!("CARGO_PKG_VERSION"));
pub const USER_AGENT_FILE_NAME: &str = "user-agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Builds the URL for `address`, honoring scheme modifiers.
pub fn build_url(address: &str, modifiers: &[String], default: Scheme) -> Result<String> {
    let mut scheme = default;
    for modifier in modifiers {
        scheme = match modifier.as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => bail!("unknown modifier {other:?}"),
        };
    }
    Ok(format!("{}://{address}", scheme.as_str()))
}

pub struct HttpBackend {
    client: reqwest::Client,
    default_scheme: Scheme,
    user_agent: Arc<RwLock<String>>,
}

impl HttpBackend {
    pub fn new(default_scheme: Scheme) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_scheme,
            user_agent: Arc::new(RwLock::new(DEFAULT_USER_AGENT.to_string())),
        }
    }

    /// Control file exposing the `User-Agent` header sent with every request.
    pub fn user_agent_file(&self) -> UserAgentFile {
        UserAgentFile {
            user_agent: self.user_agent.clone(),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Vec<u8>> {
        let user_agent = self.user_agent.read().await.clone();
        let response = request
            .header(USER_AGENT, user_agent)
            .send()
            .await
            .with_context(|| what.to_string())?
            .error_for_status()
            .with_context(|| what.to_string())?;
        let body = response
            .bytes()
            .await
            .with_context(|| format!("{what}: reading body"))?;
        debug!(bytes = body.len(), "{what}");
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch(&self, address: &str, modifiers: &[String]) -> Result<Vec<u8>> {
        let url = build_url(address, modifiers, self.default_scheme)?;
        self.send(self.client.get(&url), &format!("GET {url}")).await
    }

    async fn store(&self, address: &str, modifiers: &[String], data: &[u8]) -> Result<Vec<u8>> {
        let url = build_url(address, modifiers, self.default_scheme)?;
        let request = self.client.post(&url).body(data.to_vec());
        self.send(request, &format!("POST {url}")).await
    }
}

pub struct UserAgentFile {
    user_agent: Arc<RwLock<String>>,
}

#[async_trait]
impl ControlFile for UserAgentFile {
    fn name(&self) -> &str {
        USER_AGENT_FILE_NAME
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut contents = self.user_agent.read().await.clone().into_bytes();
        contents.push(b'\n');
        Ok(contents)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let value = std::str::from_utf8(data)
            .context("user agent is not valid UTF-8")?
            .trim();
        if value.is_empty() {
            bail!("user agent must not be empty");
        }
        *self.user_agent.write().await = value.to_string();
        Ok(())
    }
}
