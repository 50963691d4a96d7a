//! HTTP client for the manager API

use crate::common::{Error, Result};
use crate::coordinator::metadata::TableRecord;
use crate::coordinator::LocationSnapshot;
use crate::instance::WatchSummary;
use crate::ops::{FlushOutcome, TabletView};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTableResponse {
    pub tablets: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteResponse {
    pub server: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TableList {
    tables: Vec<TableRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct TabletList {
    tablets: Vec<TabletView>,
}

pub struct ManagerClient {
    client: Client,
    base_url: String,
}

impl ManagerClient {
    /// `timeout` bounds a single request; waits happen server side, so it
    /// must exceed the manager's wait timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("request failed: {}", e)))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Http(format!("invalid response: {}", e)));
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        Err(Error::Http(format!("manager returned {}: {}", status, message)))
    }

    pub async fn tables(&self) -> Result<Vec<TableRecord>> {
        let list: TableList = self.send(self.client.get(self.url("/tables"))).await?;
        Ok(list.tables)
    }

    pub async fn create_table(&self, table: &str, splits: &[String]) -> Result<usize> {
        let request = self
            .client
            .post(self.url(&format!("/tables/{}", table)))
            .json(&json!({ "splits": splits }));
        let response: CreateTableResponse = self.send(request).await?;
        Ok(response.tablets)
    }

    pub async fn delete_table(&self, table: &str) -> Result<()> {
        let _: serde_json::Value = self
            .send(self.client.delete(self.url(&format!("/tables/{}", table))))
            .await?;
        Ok(())
    }

    pub async fn locations(&self, table: &str) -> Result<Vec<TabletView>> {
        let list: TabletList = self
            .send(self.client.get(self.url(&format!("/tables/{}/locations", table))))
            .await?;
        Ok(list.tablets)
    }

    pub async fn location(
        &self,
        table: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<LocationSnapshot> {
        let mut query = Vec::new();
        if let Some(start) = start {
            query.push(("start", start));
        }
        if let Some(end) = end {
            query.push(("end", end));
        }
        let request = self
            .client
            .get(self.url(&format!("/tables/{}/location", table)))
            .query(&query);
        self.send(request).await
    }

    pub async fn write(&self, table: &str, row: &str, value: &str) -> Result<String> {
        let request = self
            .client
            .post(self.url(&format!("/tables/{}/rows", table)))
            .json(&json!({ "row": row, "value": value }));
        let response: WriteResponse = self.send(request).await?;
        Ok(response.server)
    }

    pub async fn flush(
        &self,
        table: &str,
        start: Option<&str>,
        end: Option<&str>,
        wait: bool,
    ) -> Result<FlushOutcome> {
        let mut query = vec![("wait", wait.to_string())];
        if let Some(start) = start {
            query.push(("start", start.to_string()));
        }
        if let Some(end) = end {
            query.push(("end", end.to_string()));
        }
        let request = self
            .client
            .post(self.url(&format!("/tables/{}/flush", table)))
            .query(&query);
        self.send(request).await
    }

    pub async fn set_online(&self, table: &str, wait: bool) -> Result<()> {
        self.set_goal(table, "online", wait).await
    }

    pub async fn set_offline(&self, table: &str, wait: bool) -> Result<()> {
        self.set_goal(table, "offline", wait).await
    }

    async fn set_goal(&self, table: &str, goal: &str, wait: bool) -> Result<()> {
        let request = self
            .client
            .post(self.url(&format!("/tables/{}/{}", table, goal)))
            .query(&[("wait", wait)]);
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }

    pub async fn watches(&self) -> Result<WatchSummary> {
        self.send(self.client.get(self.url("/admin/watches"))).await
    }

    pub async fn property(&self, key: &str) -> Result<String> {
        let body: serde_json::Value = self
            .send(
                self.client
                    .get(self.url(&format!("/admin/properties/{}", key))),
            )
            .await?;
        Ok(body["value"].as_str().unwrap_or_default().to_string())
    }

    pub async fn set_property(&self, key: &str, value: &str) -> Result<()> {
        let request = self
            .client
            .put(self.url(&format!("/admin/properties/{}", key)))
            .body(value.to_string());
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }
}
