use std::future::Future;
use std::time::Duration;

use ghostpixel_protocol::{PixelWrite, PlacePixelRequest};
use reqwest::Client;
use tracing::{info, warn};

use crate::error::SubmitError;
use crate::host::HostAdapter;
use crate::template::TemplatePixel;

pub const DEFAULT_ENDPOINT: &str = "https://geopixels.net/PlacePixel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
    pub body: String,
}

impl SinkResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport for one placement request.
pub trait PixelSink: Send + Sync + 'static {
    fn send(
        &self,
        request: &PlacePixelRequest,
    ) -> impl Future<Output = Result<SinkResponse, SubmitError>> + Send;
}

/// JSON-over-HTTP sink for the real placement endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SubmitError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl PixelSink for HttpSink {
    async fn send(&self, request: &PlacePixelRequest) -> Result<SinkResponse, SubmitError> {
        let resp = self.client.post(&self.endpoint).json(request).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok(SinkResponse { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Placed(usize),
    /// The batch was not placed; it will show up again in the next diff.
    Failed {
        status: Option<u16>,
        message: String,
    },
    /// No usable credentials remain.
    SessionEnded,
}

pub fn to_writes(pixels: &[TemplatePixel]) -> Vec<PixelWrite> {
    pixels
        .iter()
        .map(|p| PixelWrite {
            grid_x: p.grid.x,
            grid_y: p.grid.y,
            color: p.color.identity().get(),
            user_id: None,
        })
        .collect()
}

/// Sends one batch, re-authenticating on 401 and retrying the same batch.
///
/// The batch is sent at most `max_attempts` times. A failed re-authentication
/// clears the host session and ends it.
pub async fn submit_batch<H: HostAdapter, S: PixelSink>(
    host: &H,
    sink: &S,
    pixels: &[TemplatePixel],
    max_attempts: u32,
) -> SubmitOutcome {
    let writes = to_writes(pixels);
    let max_attempts = max_attempts.max(1);
    let mut last_status = None;

    for attempt in 1..=max_attempts {
        let Some(session) = host.session().filter(|s| s.is_valid()) else {
            return SubmitOutcome::SessionEnded;
        };
        let request = PlacePixelRequest::new(
            session.token,
            session.subject,
            session.user_id,
            writes.iter().cloned(),
        );

        let resp = match sink.send(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "failed to place pixels");
                return SubmitOutcome::Failed {
                    status: None,
                    message: e.to_string(),
                };
            }
        };

        if resp.is_success() {
            info!("placed {} pixels", writes.len());
            return SubmitOutcome::Placed(writes.len());
        }

        warn!(status = resp.status, attempt, body = %resp.body, "failed to place pixels");
        if resp.status != 401 {
            return SubmitOutcome::Failed {
                status: Some(resp.status),
                message: resp.body,
            };
        }
        last_status = Some(resp.status);
        if attempt == max_attempts {
            break;
        }

        info!("session expired, attempting re-login");
        if !host.reauthenticate().await {
            info!("re-login failed");
            host.clear_session();
            return SubmitOutcome::SessionEnded;
        }
        info!("re-login successful");
    }

    SubmitOutcome::Failed {
        status: last_status,
        message: format!("still unauthorized after {max_attempts} attempts"),
    }
}
