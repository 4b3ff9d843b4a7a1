//! REST race directory
//!
//! The two HTTP collaborators the engine needs: the race snapshot read
//! at mount (and on the finished-race refetch) and the quick-match
//! rematch creation. Everything else stays on the WebSocket.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use tracing::debug;

use crate::core::error::DirectoryError;
use crate::core::io::RaceDirectory;
use crate::core::protocol::{QuickMatch, RaceSnapshot};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// [`RaceDirectory`] backed by the server's REST API.
pub struct HttpRaceDirectory {
    base_url: String,
    client: Client,
}

impl HttpRaceDirectory {
    pub fn new(base_url: &str) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DirectoryError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, DirectoryError> {
        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }
        response
            .json()
            .map_err(|e| DirectoryError::Payload(e.to_string()))
    }
}

impl RaceDirectory for HttpRaceDirectory {
    fn fetch_race(&self, race_id: &str) -> Result<RaceSnapshot, DirectoryError> {
        let url = format!("{}/races/{}", self.base_url, race_id);
        debug!(url = %url, "[REST] Fetching race snapshot");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| DirectoryError::Http(e.to_string()))?;
        Self::parse(response)
    }

    fn quick_match(&self) -> Result<QuickMatch, DirectoryError> {
        let url = format!("{}/races/quick-match", self.base_url);
        debug!(url = %url, "[REST] Creating quick-match race");
        let response = self
            .client
            .post(&url)
            .send()
            .map_err(|e| DirectoryError::Http(e.to_string()))?;
        Self::parse(response)
    }
}
