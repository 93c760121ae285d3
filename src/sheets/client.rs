//! Thin REST client over the spreadsheet API.
//!
//! One method per API call, no hidden requests: quota discipline lives in
//! the projector, which budgets calls per cycle, so this layer must never
//! add its own. Quota exhaustion is classified here (429, or 403 carrying a
//! rate/quota reason) so the projector can apply its single retry.

use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::sheets::auth::TokenProvider;

#[derive(Debug, Clone)]
pub struct SheetProperties {
    pub sheet_id: i64,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct ValueRange {
    pub range: String,
    pub values: Vec<Vec<Value>>,
}

pub struct SheetsClient {
    http: Client,
    base_url: String,
    spreadsheet_id: String,
    auth: TokenProvider,
}

impl SheetsClient {
    pub fn new(
        base_url: String,
        spreadsheet_id: String,
        auth: TokenProvider,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("stocksync/0.1 (sheet projector)")
            .build()
            .map_err(|e| SyncError::internal(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            spreadsheet_id,
            auth,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}{}",
            self.base_url, self.spreadsheet_id, suffix
        )
    }

    async fn handle_response(label: &str, resp: reqwest::Response) -> SyncResult<Value> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Value>()
                .await
                .map_err(|e| SyncError::internal(format!("{label} parse: {e}")));
        }

        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || (status == reqwest::StatusCode::FORBIDDEN
                && (body.contains("RESOURCE_EXHAUSTED")
                    || body.contains("rateLimitExceeded")
                    || body.contains("quota")))
        {
            return Err(SyncError::quota(format!("{label} {status}: {body}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::credential(format!("{label} {status}: {body}")));
        }
        Err(SyncError::internal(format!("{label} {status}: {body}")))
    }

    /// One read unit. Worksheet list with ids and titles.
    pub async fn spreadsheet_meta(&self) -> SyncResult<Vec<SheetProperties>> {
        let token = self.auth.bearer().await?;
        let resp = self
            .http
            .get(self.url("?fields=sheets.properties"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SyncError::internal(format!("spreadsheet meta: {e}")))?;

        let body = Self::handle_response("spreadsheet meta", resp).await?;
        let sheets = body["sheets"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| {
                let props = &s["properties"];
                Some(SheetProperties {
                    sheet_id: props["sheetId"].as_i64()?,
                    title: props["title"].as_str()?.to_string(),
                })
            })
            .collect();
        Ok(sheets)
    }

    pub async fn add_sheet(&self, title: &str) -> SyncResult<i64> {
        let token = self.auth.bearer().await?;
        let body = json!({
            "requests": [ { "addSheet": { "properties": { "title": title } } } ]
        });
        let resp = self
            .http
            .post(self.url(":batchUpdate"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::internal(format!("add sheet: {e}")))?;

        let body = Self::handle_response("add sheet", resp).await?;
        body["replies"][0]["addSheet"]["properties"]["sheetId"]
            .as_i64()
            .ok_or_else(|| SyncError::internal("add sheet reply missing sheetId"))
    }

    pub async fn rename_sheet(&self, sheet_id: i64, new_title: &str) -> SyncResult<()> {
        let token = self.auth.bearer().await?;
        let body = json!({
            "requests": [ { "updateSheetProperties": {
                "properties": { "sheetId": sheet_id, "title": new_title },
                "fields": "title"
            } } ]
        });
        let resp = self
            .http
            .post(self.url(":batchUpdate"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::internal(format!("rename sheet: {e}")))?;

        Self::handle_response("rename sheet", resp).await?;
        debug!(sheet_id, new_title, "Worksheet renamed");
        Ok(())
    }

    /// One read unit regardless of how many ranges are asked for.
    pub async fn values_batch_get(&self, ranges: &[String]) -> SyncResult<Vec<ValueRange>> {
        let token = self.auth.bearer().await?;
        let mut query: Vec<(&str, String)> = ranges
            .iter()
            .map(|r| ("ranges", r.clone()))
            .collect();
        query.push(("majorDimension", "ROWS".to_string()));

        let resp = self
            .http
            .get(self.url("/values:batchGet"))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| SyncError::internal(format!("batch get: {e}")))?;

        let body = Self::handle_response("batch get", resp).await?;
        let value_ranges = body["valueRanges"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|vr| ValueRange {
                range: vr["range"].as_str().unwrap_or_default().to_string(),
                values: vr["values"]
                    .as_array()
                    .map(|rows| {
                        rows.iter()
                            .map(|row| row.as_array().cloned().unwrap_or_default())
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
        Ok(value_ranges)
    }

    /// One write unit; the server applies all ranges atomically.
    pub async fn values_batch_update(
        &self,
        data: &[(String, Vec<Vec<Value>>)],
    ) -> SyncResult<()> {
        let token = self.auth.bearer().await?;
        let body = json!({
            "valueInputOption": "RAW",
            "data": data
                .iter()
                .map(|(range, values)| json!({ "range": range, "values": values }))
                .collect::<Vec<_>>(),
        });
        let resp = self
            .http
            .post(self.url("/values:batchUpdate"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::internal(format!("batch update: {e}")))?;

        Self::handle_response("batch update", resp).await?;
        Ok(())
    }

    pub async fn values_clear(&self, range: &str) -> SyncResult<()> {
        let token = self.auth.bearer().await?;
        let resp = self
            .http
            .post(self.url(&format!("/values/{}:clear", range)))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| SyncError::internal(format!("clear range: {e}")))?;

        Self::handle_response("clear range", resp).await?;
        Ok(())
    }
}
