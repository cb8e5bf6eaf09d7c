//! Calls against a running `mwt-admin` server.

use anyhow::{bail, Context};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use url::Url;

const AUTH_HEADER: &str = "auth";

pub struct AdminClient {
    base: Url,
    password: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base: &str, password: String) -> anyhow::Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid admin url '{base}'"))?;
        Ok(Self {
            base,
            password,
            http: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("cannot join '{path}' onto {}", self.base))
    }

    pub async fn update_settings(&self, query: &[(&str, String)]) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.endpoint("automation/update-settings")?)
            .header(AUTH_HEADER, &self.password)
            .query(query)
            .send()
            .await
            .context("settings update request failed")?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn app_settings(&self) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .get(self.endpoint("automation/app-settings")?)
            .header(AUTH_HEADER, &self.password)
            .send()
            .await
            .context("app-settings request failed")?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Streams an export into `out`, returning the number of bytes written.
    pub async fn export(
        &self,
        start: &str,
        end: &str,
        format: &str,
        out: &Path,
    ) -> anyhow::Result<u64> {
        let response = self
            .http
            .get(self.endpoint("automation/offline")?)
            .header(AUTH_HEADER, &self.password)
            .query(&[
                ("startTimeInclusive", start),
                ("endTimeExclusive", end),
                ("dataFormat", format),
            ])
            .send()
            .await
            .context("export request failed")?;
        let mut response = ensure_success(response).await?;

        let mut file = tokio::fs::File::create(out)
            .await
            .with_context(|| format!("failed to create {}", out.display()))?;
        let mut written = 0u64;
        // A server-side fault surfaces here as a body error, not a short file.
        while let Some(chunk) = response.chunk().await.context("export stream aborted")? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

async fn ensure_success(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("admin server answered {status}: {body}")
}
