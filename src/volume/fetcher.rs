use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Url;
use serde::Deserialize;

use crate::error::FetchError;
use crate::model::VolumeSnapshot;

/// Pull-style query for cumulative volume and trading value of one code.
#[async_trait]
pub trait VolumeFetcher: Send + Sync {
    async fn fetch(&self, code: &str) -> Result<VolumeSnapshot, FetchError>;
}

#[derive(Debug, Deserialize)]
struct VolumeResponse {
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    trading_value: Option<u64>,
}

/// REST implementation: `GET {base_url}/{code}`.
pub struct HttpVolumeFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpVolumeFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;

        let base_url = Url::parse(base_url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::InvalidUrl(base_url.to_string()));
        }

        Ok(Self { client, base_url })
    }

    /// Appends `code` as a single percent-encoded path segment.
    fn url_for(&self, code: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(code);
        Ok(url)
    }
}

#[async_trait]
impl VolumeFetcher for HttpVolumeFetcher {
    async fn fetch(&self, code: &str) -> Result<VolumeSnapshot, FetchError> {
        let url = self.url_for(code)?;
        debug!("Fetching volume for {} from {}", code, url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: code.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let parsed: VolumeResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Malformed(format!("{}: {}", code, e)))?;

        Ok(VolumeSnapshot {
            volume: parsed.volume,
            trading_value: parsed.trading_value,
        })
    }
}
