//! `Communicator` that talks to a remote routine host over HTTP.

use async_trait::async_trait;
use fabric_core::communicator::{CommunicationTraits, Communicator, InvokePreferences};
use fabric_core::intent::{ContinueRoutineIntent, ExecuteRoutineIntent};
use fabric_core::retry::RetryPolicy;
use fabric_core::types::{routine_key, ETag};
use fabric_core::{ActiveRoutineInfo, FabricError, InvokeOutcome, Result};
use reqwest::{Client, Method, Response, StatusCode};
use std::time::Duration;
use url::Url;

use crate::wire::{
    self, EnvelopeType, RequestHeaders, WireStatus, HEADER_ETAG, HEADER_ROUTINE_ID,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for one remote host. Retries transport failures and 5xx
/// responses under `retry`, flagging repeats with `x-fabric-retry`.
pub struct HttpCommunicator {
    name: String,
    base: Url,
    http: Client,
    retry: RetryPolicy,
}

impl HttpCommunicator {
    pub fn new(name: impl Into<String>, base: Url) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| FabricError::configuration(format!("building HTTP client: {e}")))?;
        Ok(Self::with_client(name, base, http))
    }

    pub fn with_client(name: impl Into<String>, base: Url, http: Client) -> Self {
        Self {
            name: name.into(),
            base,
            http,
            retry: RetryPolicy::interactive(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        headers: &RequestHeaders,
        body: Option<&[u8]>,
    ) -> Result<Response> {
        let mut attempt: u32 = 0;
        loop {
            let mut request = self.http.request(method.clone(), url.clone());
            for (name, value) in headers.clone().retry(attempt > 0).iter() {
                request = request.header(name, value);
            }
            if let Some(body) = body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.to_vec());
            }

            let error = match request.send().await {
                Ok(response) if !response.status().is_server_error() => return Ok(response),
                Ok(response) => FabricError::transient(format!(
                    "{} {} returned {}",
                    method,
                    url.path(),
                    response.status()
                )),
                Err(e) => FabricError::transient_with_source(
                    format!("{} {} failed", method, url.path()),
                    e,
                ),
            };
            attempt += 1;
            if !self.retry.allows(attempt) {
                return Err(error);
            }
            let delay = self.retry.backoff.next(attempt - 1);
            tracing::debug!(
                communicator = %self.name,
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying HTTP request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn read_status(&self, response: Response) -> Result<(WireStatus, Option<ETag>, Option<String>, Vec<u8>)> {
        let code = response.status();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(HEADER_ETAG).map(ETag::new);
        let routine_id = header(HEADER_ROUTINE_ID);
        let body = response
            .bytes()
            .await
            .map_err(|e| FabricError::transient_with_source("reading response body", e))?
            .to_vec();
        match WireStatus::from_code(code.as_u16()) {
            Some(status) => Ok((status, etag, routine_id, body)),
            None => Err(unexpected_status(&self.name, code, &body)),
        }
    }
}

fn unexpected_status(name: &str, code: StatusCode, body: &[u8]) -> FabricError {
    let detail: String = String::from_utf8_lossy(body).chars().take(200).collect();
    match code {
        StatusCode::NOT_FOUND => FabricError::ResourceMissing(format!("{name}: {detail}")),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            FabricError::transient(format!("{name} returned {code}"))
        }
        _ => FabricError::Routine {
            routine: name.to_string(),
            message: format!("unexpected status {code}: {detail}"),
        },
    }
}

#[async_trait]
impl Communicator for HttpCommunicator {
    fn name(&self) -> &str {
        &self.name
    }

    fn traits(&self) -> CommunicationTraits {
        CommunicationTraits::SYNC_REPLIES
    }

    async fn invoke(
        &self,
        intent: &ExecuteRoutineIntent,
        prefs: &InvokePreferences,
    ) -> Result<InvokeOutcome> {
        let url = wire::invoke_url(&self.base, &intent.service, &intent.method)?;
        let headers = wire::invoke_headers(intent, prefs.synchronous)?;
        let body = serde_json::to_vec(&intent.parameters)?;
        let response = self.send(Method::POST, &url, &headers, Some(&body)).await?;
        let (status, etag, routine_id, body) = self.read_status(response).await?;

        let mut info = ActiveRoutineInfo::for_intent(
            intent,
            routine_id.unwrap_or_else(|| routine_key(&intent.service, &intent.method, &intent.id)),
        );
        info.etag = etag;
        tracing::debug!(
            communicator = %self.name,
            intent_id = %intent.id,
            service = %intent.service,
            method = %intent.method,
            status = status.code(),
            "HTTP invoke answered"
        );
        match wire::decode_result(status, &body)? {
            Some(result) => Ok(InvokeOutcome::Completed(result)),
            None if status == WireStatus::Deduplicated => Ok(InvokeOutcome::Deduplicated(info)),
            None => Ok(InvokeOutcome::Scheduled(info)),
        }
    }

    async fn continue_routine(&self, intent: &ContinueRoutineIntent) -> Result<()> {
        let target = &intent.continuation;
        let url = wire::routine_url(
            &self.base,
            &target.service,
            &target.routine.method,
            &target.routine.intent_id,
            target.routine.etag.as_ref(),
        )?;
        let headers = wire::continue_headers(intent);
        let body = serde_json::to_vec(&intent.result)?;
        let response = self.send(Method::POST, &url, &headers, Some(&body)).await?;
        let code = response.status();
        if code.is_success() || code == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(unexpected_status(&self.name, code, &body))
    }

    async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo> {
        let url = wire::routine_url(&self.base, &info.service, &info.method, &info.intent_id, None)?;
        let headers = RequestHeaders::new(EnvelopeType::Poll, &info.intent_id);
        let response = self.send(Method::GET, &url, &headers, None).await?;
        let (status, etag, _, body) = self.read_status(response).await?;

        let mut polled = info.clone();
        if etag.is_some() {
            polled.etag = etag;
        }
        polled.result = wire::decode_result(status, &body)?;
        Ok(polled)
    }
}
