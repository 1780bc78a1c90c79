use crate::errors::{FetchError, FetchResult};
use std::time::Duration;

/// Fetches the source payload for a `codeLocation = remote` request
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> FetchResult<Vec<u8>>;
}

/// Default fetcher: HTTP(S) URLs via reqwest, anything else is treated as
/// a local file path.
#[derive(Debug)]
pub struct RemoteSourceFetcher {
    client: reqwest::Client,
}

impl RemoteSourceFetcher {
    pub fn new() -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client })
    }
}

impl SourceFetcher for RemoteSourceFetcher {
    async fn fetch(&self, location: &str) -> FetchResult<Vec<u8>> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let response = self.client.get(location).send().await?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound(location.to_string()));
            }
            let response = response.error_for_status()?;

            return Ok(response.bytes().await?.to_vec());
        }

        match tokio::fs::read(location).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(location.to_string()))
            }
            Err(e) => Err(FetchError::Io(e)),
        }
    }
}
