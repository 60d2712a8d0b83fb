//! `reqwest` implementation of [`BackendApi`]

use super::{
    BackendApi, BackendError, BackendOperation, SensorReading, TicketRecord, TicketsResponse,
    TripSummary,
};
use crate::config::BackendSection;
use crate::error::sanitize_error_message;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const TICKETS_PATH: &str = "manager/tickets";
const TRIP_SUMMARY_PATH: &str = "manager/trip-summary";
const SENSOR_READINGS_PATH: &str = "manager/sensor-readings";

pub struct HttpBackend {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendSection, token: Option<String>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        let base_url = normalize_base_url(&config.base_url)?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn endpoint(&self, path: &str, operation: BackendOperation) -> Result<Url, BackendError> {
        self.base_url.join(path).map_err(|e| BackendError::Request {
            operation,
            message: format!("invalid endpoint {path}: {e}"),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        operation: BackendOperation,
    ) -> Result<Response, BackendError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| {
                let message = format!(
                    "{} (is_connect: {}, is_timeout: {})",
                    e,
                    e.is_connect(),
                    e.is_timeout()
                );
                warn!(
                    operation = %operation,
                    error = %sanitize_error_message(&message),
                    "Backend request failed"
                );
                BackendError::Request { operation, message }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                operation,
                status: status.as_u16(),
                body: sanitize_error_message(&body),
            });
        }

        debug!(operation = %operation, status = status.as_u16(), "Backend request ok");
        Ok(response)
    }

    async fn post_json<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        operation: BackendOperation,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(path, operation)?;
        self.send(self.client.post(url).json(body), operation)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_tickets(&self, date: NaiveDate) -> Result<Vec<TicketRecord>, BackendError> {
        let operation = BackendOperation::TicketPoll;
        let mut url = self.endpoint(TICKETS_PATH, operation)?;
        url.query_pairs_mut()
            .append_pair("date", &date.format("%Y-%m-%d").to_string());

        let response = self.send(self.client.get(url), operation).await?;
        let body: TicketsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode {
                operation,
                message: e.to_string(),
            })?;

        Ok(body.into_records())
    }

    async fn submit_trip_summary(&self, summary: &TripSummary) -> Result<(), BackendError> {
        self.post_json(TRIP_SUMMARY_PATH, summary, BackendOperation::TripSummary)
            .await
    }

    async fn post_sensor_reading(&self, reading: &SensorReading) -> Result<(), BackendError> {
        self.post_json(SENSOR_READINGS_PATH, reading, BackendOperation::SensorReading)
            .await
    }
}

/// Parse the base URL and make sure relative joins append to its path
fn normalize_base_url(raw: &str) -> Result<Url, BackendError> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&with_slash)
        .map_err(|e| BackendError::Client(format!("invalid base URL {raw}: {e}")))
}
