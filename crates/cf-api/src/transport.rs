//! Raw platform transport.
//!
//! [`CloudController`] is the seam between the retry/refresh machinery and the
//! wire. Each call takes the access token explicitly so the token manager can
//! replay it with renewed credentials.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use reqwest::{Client, StatusCode};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{ApiError, Result};
use crate::models::{AppResource, Application, CcErrorBody, LogEnvelope, LogMessage};

/// Live log stream. Dropping it closes the underlying connection.
pub type LogStream = BoxStream<'static, Result<LogMessage>>;

/// Cloud Controller error code for a rejected token.
const INVALID_AUTH_TOKEN_CODE: &str = "CF-InvalidAuthToken";

const INVALID_ENDPOINT_CODE: &str = "InvalidEndpoint";

#[async_trait]
pub trait CloudController: Send + Sync {
    /// Fetch the current application snapshot.
    async fn fetch_application(&self, access_token: &str, guid: &str) -> Result<Application>;

    /// Open the application's log stream.
    async fn connect_log_stream(&self, access_token: &str, guid: &str) -> Result<LogStream>;
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared `reqwest::Client` used for API and identity provider calls.
pub fn build_http_client(request_timeout: Duration, skip_ssl_validation: bool) -> Result<Client> {
    install_rustls_provider();

    let mut builder = Client::builder()
        .user_agent(concat!("cf-stager/", env!("CARGO_PKG_VERSION")))
        .danger_accept_invalid_certs(skip_ssl_validation);

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    Ok(builder.build()?)
}

/// Cloud Controller v2 API plus the websocket log endpoint.
#[derive(Debug, Clone)]
pub struct HttpCloudController {
    client: Client,
    api_endpoint: String,
    doppler_endpoint: String,
}

impl HttpCloudController {
    /// Create a controller for the given API (`http[s]://`) and log (`ws[s]://`) endpoints.
    pub fn new(client: Client, api_endpoint: &str, doppler_endpoint: &str) -> Result<Self> {
        parse_endpoint(api_endpoint, &["https", "http"])?;
        parse_endpoint(doppler_endpoint, &["wss", "ws"])?;

        Ok(Self {
            client,
            api_endpoint: api_endpoint.trim_end_matches('/').to_string(),
            doppler_endpoint: doppler_endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn app_url(&self, guid: &str) -> String {
        format!("{}/v2/apps/{}", self.api_endpoint, guid)
    }

    fn stream_url(&self, guid: &str) -> String {
        format!("{}/apps/{}/stream", self.doppler_endpoint, guid)
    }
}

/// Parse `endpoint`, requiring one of `schemes`.
pub fn parse_endpoint(endpoint: &str, schemes: &[&str]) -> Result<Url> {
    let url = Url::parse(endpoint)
        .map_err(|e| ApiError::validation(INVALID_ENDPOINT_CODE, format!("'{endpoint}': {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ApiError::validation(INVALID_ENDPOINT_CODE, format!(
            "endpoint '{endpoint}' must use one of: {}",
            schemes.join(", ")
        )));
    }
    Ok(url)
}

/// Map a non-success Cloud Controller response to an [`ApiError`].
fn classify_error_response(status: StatusCode, url: &str, body: &str) -> ApiError {
    let body: CcErrorBody = serde_json::from_str(body).unwrap_or_default();

    if status == StatusCode::UNAUTHORIZED || body.error_code == INVALID_AUTH_TOKEN_CODE {
        return ApiError::AuthExpired;
    }

    match status {
        StatusCode::NOT_FOUND => {
            let resource = if body.description.is_empty() {
                url.to_string()
            } else {
                body.description
            };
            ApiError::not_found(resource)
        }
        StatusCode::UNPROCESSABLE_ENTITY => ApiError::validation(body.error_code, body.description),
        _ => ApiError::http_status(status, url, body.description),
    }
}

fn decode_frame(bytes: &[u8]) -> Option<Result<LogMessage>> {
    match serde_json::from_slice::<LogEnvelope>(bytes) {
        Ok(envelope) => Some(Ok(envelope.into())),
        Err(e) => {
            warn!(error = %e, "Dropping undecodable log frame");
            None
        }
    }
}

fn map_frame(frame: std::result::Result<Message, tungstenite::Error>) -> Option<Result<LogMessage>> {
    match frame {
        Ok(Message::Text(text)) => decode_frame(text.as_str().as_bytes()),
        Ok(Message::Binary(data)) => decode_frame(&data),
        // Close ends the stream on the next poll; control frames carry no logs.
        Ok(Message::Close(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(ApiError::websocket(e.to_string()))),
    }
}

#[async_trait]
impl CloudController for HttpCloudController {
    #[instrument(skip(self, access_token))]
    async fn fetch_application(&self, access_token: &str, guid: &str) -> Result<Application> {
        let url = self.app_url(guid);
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_response(status, &url, &body));
        }

        let resource: AppResource = response
            .json()
            .await
            .map_err(|e| ApiError::decode(e.to_string()))?;

        Ok(resource.into())
    }

    #[instrument(skip(self, access_token))]
    async fn connect_log_stream(&self, access_token: &str, guid: &str) -> Result<LogStream> {
        let url = self.stream_url(guid);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ApiError::websocket(format!("invalid stream url {url}: {e}")))?;

        let auth = HeaderValue::from_str(&format!("bearer {access_token}"))
            .map_err(|e| ApiError::websocket(format!("invalid authorization header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) => {
                let status = StatusCode::from_u16(response.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                return Err(match status {
                    StatusCode::UNAUTHORIZED => ApiError::AuthExpired,
                    StatusCode::NOT_FOUND => ApiError::not_found(url),
                    _ => ApiError::http_status(status, url, "log stream handshake rejected"),
                });
            }
            Err(e) => return Err(ApiError::websocket(e.to_string())),
        };

        debug!("Log stream connected");

        Ok(ws_stream
            .filter_map(|frame| futures::future::ready(map_frame(frame)))
            .boxed())
    }
}
