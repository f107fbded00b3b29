//! Thin management-API client used by the CLI subcommands.

use anyhow::Context as _;

#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    endpoint: String,
    tenant_id: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub(crate) fn new(endpoint: String, tenant_id: String) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            tenant_id,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.endpoint));
        if !self.tenant_id.is_empty() {
            builder = builder.header("x-tenant-id", &self.tenant_id);
        }
        builder
    }

    pub(crate) async fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    pub(crate) async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        self.send(self.request(reqwest::Method::POST, path).json(body))
            .await
    }

    pub(crate) async fn put(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        self.send(self.request(reqwest::Method::PUT, path).json(body))
            .await
    }

    pub(crate) async fn delete(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        self.send(self.request(reqwest::Method::DELETE, path)).await
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
        let response = builder.send().await.context("request failed")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("server responded {status}: {body}");
        }
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).context("response is not valid JSON")
    }
}

/// Print a JSON value for human consumption.
pub(crate) fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{value}"),
    }
}
