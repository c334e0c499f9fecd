//! Local media storage and remote media fetching.

use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use wagate_core::config::MediaConfig;
use wagate_core::error::GatewayError;
use wagate_core::shellexpand;

/// Browser-like agent for hosts that reject unknown clients.
const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Writes media under a public directory and hands back its URL.
#[derive(Clone)]
pub struct MediaStore {
    dir: PathBuf,
    public_base_url: String,
    http: reqwest::Client,
}

impl MediaStore {
    pub fn new(config: &MediaConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Media(format!("http client init failed: {e}")))?;
        Ok(Self {
            dir: PathBuf::from(shellexpand(&config.dir)),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Persist bytes as `{dir}/{company}/{uuid}.{ext}` and return the public URL.
    pub async fn save(
        &self,
        company_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<String, GatewayError> {
        let folder = self.dir.join(company_id);
        tokio::fs::create_dir_all(&folder).await?;
        let file_name = format!("{}.{extension}", Uuid::new_v4());
        tokio::fs::write(folder.join(&file_name), bytes).await?;
        Ok(format!("{}/{company_id}/{file_name}", self.public_base_url))
    }

    /// Download a remote URL. Retries once with a browser user agent when
    /// the host refuses the default client.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Media(format!("fetch {url} failed: {e}")))?;

        let resp = if matches!(resp.status().as_u16(), 401 | 403) {
            debug!("media host refused default client for {url}, retrying");
            self.http
                .get(url)
                .header(reqwest::header::USER_AGENT, FALLBACK_USER_AGENT)
                .send()
                .await
                .map_err(|e| GatewayError::Media(format!("fetch {url} failed: {e}")))?
        } else {
            resp
        };

        if !resp.status().is_success() {
            return Err(GatewayError::Media(format!(
                "fetch {url} returned {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Media(format!("read {url} failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_writes_file_and_returns_public_url() {
        let dir = std::env::temp_dir().join(format!("__wagate_media_{}", Uuid::new_v4()));
        let config = MediaConfig {
            dir: dir.to_string_lossy().into_owned(),
            public_base_url: "http://media.local/files/".into(),
            ..Default::default()
        };
        let media = MediaStore::new(&config).unwrap();

        let url = media.save("t1", "ogg", b"voice").await.unwrap();
        assert!(url.starts_with("http://media.local/files/t1/"));
        assert!(url.ends_with(".ogg"));

        let name = url.rsplit('/').next().unwrap();
        let on_disk = std::fs::read(dir.join("t1").join(name)).unwrap();
        assert_eq!(on_disk, b"voice");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
