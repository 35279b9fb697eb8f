use crate::billing::sigv4::RequestSigner;
use crate::billing::BillingApi;
use crate::error::AppError;
use crate::models::{
    CostAndUsageQuery, CostAndUsageResult, DateInterval, Dimension, DimensionValue, Granularity,
    MetricKind, ReportingWindow, ResultByTime,
};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://ce.us-east-1.amazonaws.com";
pub const REGION: &str = "us-east-1";
const SERVICE: &str = "ce";
const TARGET_PREFIX: &str = "AWSInsightsIndexService";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetDimensionValuesRequest<'a> {
    dimension: Dimension,
    time_period: DateInterval,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetDimensionValuesResponse {
    #[serde(default)]
    dimension_values: Vec<DimensionValue>,
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GroupDefinition {
    #[serde(rename = "Type")]
    kind: &'static str,
    key: Dimension,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetCostAndUsageRequest<'a> {
    time_period: DateInterval,
    granularity: Granularity,
    metrics: &'a [MetricKind],
    group_by: Vec<GroupDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetCostAndUsageResponse {
    #[serde(default)]
    results_by_time: Vec<ResultByTime>,
    next_page_token: Option<String>,
}

/// Cost Explorer over its JSON 1.1 protocol, signed with SigV4.
pub struct CostExplorerClient {
    client: Client,
    endpoint: Url,
    signer: RequestSigner,
}

impl CostExplorerClient {
    pub fn new(credentials: Credentials, endpoint: Url) -> Result<Self, AppError> {
        if endpoint.host_str().is_none() {
            return Err(AppError::ConnectionSetup(format!(
                "endpoint '{endpoint}' has no host"
            )));
        }

        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::ConnectionSetup(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            signer: RequestSigner::new(credentials, REGION, SERVICE),
        })
    }

    async fn call<Req, Resp>(&self, operation: &'static str, request: &Req) -> Result<Resp, AppError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let target = format!("{TARGET_PREFIX}.{operation}");
        let signed = self.signer.signed_headers(
            "POST",
            self.endpoint.as_str(),
            &[("content-type", CONTENT_TYPE), ("x-amz-target", target.as_str())],
            &body,
            Utc::now(),
        )?;

        debug!(operation, endpoint = %self.endpoint, "cost explorer request");

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", target.as_str());
        for (name, value) in &signed {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::upstream(operation, e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::upstream(operation, e.to_string()))?;

        if !status.is_success() {
            return Err(AppError::upstream(operation, describe_error(status, &text)));
        }

        serde_json::from_str(&text)
            .map_err(|e| AppError::upstream(operation, format!("undecodable response: {e}")))
    }
}

/// Renders an AWS JSON error body as `Kind: message (HTTP status)`.
fn describe_error(status: StatusCode, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let kind = parsed
        .as_ref()
        .and_then(|v| v.get("__type"))
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("Message")))
        .and_then(Value::as_str)
        .map(ToString::to_string);

    match (kind, message) {
        (Some(kind), Some(message)) => format!("{kind}: {message} (HTTP {status})"),
        (Some(kind), None) => format!("{kind} (HTTP {status})"),
        (None, Some(message)) => format!("{message} (HTTP {status})"),
        (None, None) if body.trim().is_empty() => format!("HTTP {status}"),
        (None, None) => format!("HTTP {status}: {}", body.trim()),
    }
}

fn next_token(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty())
}

#[async_trait]
impl BillingApi for CostExplorerClient {
    async fn list_dimension_values(
        &self,
        dimension: Dimension,
        window: &ReportingWindow,
    ) -> Result<Vec<DimensionValue>, AppError> {
        let mut values = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let request = GetDimensionValuesRequest {
                dimension,
                time_period: window.interval(),
                next_page_token: token.as_deref(),
            };
            let page: GetDimensionValuesResponse =
                self.call("GetDimensionValues", &request).await?;
            debug!(count = page.dimension_values.len(), "dimension values page");
            values.extend(page.dimension_values);

            token = next_token(page.next_page_token);
            if token.is_none() {
                break;
            }
        }

        Ok(values)
    }

    async fn query_cost_and_usage(
        &self,
        query: &CostAndUsageQuery,
    ) -> Result<CostAndUsageResult, AppError> {
        let mut result = CostAndUsageResult::default();
        let mut token: Option<String> = None;

        loop {
            let request = GetCostAndUsageRequest {
                time_period: query.window.interval(),
                granularity: query.granularity,
                metrics: &query.metrics,
                group_by: vec![GroupDefinition {
                    kind: "DIMENSION",
                    key: query.group_by,
                }],
                next_page_token: token.as_deref(),
            };
            let page: GetCostAndUsageResponse = self.call("GetCostAndUsage", &request).await?;
            debug!(buckets = page.results_by_time.len(), "cost and usage page");

            // Later pages continue the groups of the bucket at the same position.
            for (idx, bucket) in page.results_by_time.into_iter().enumerate() {
                match result.results_by_time.get_mut(idx) {
                    Some(existing) => existing.groups.extend(bucket.groups),
                    None => result.results_by_time.push(bucket),
                }
            }

            token = next_token(page.next_page_token);
            if token.is_none() {
                break;
            }
        }

        Ok(result)
    }
}
