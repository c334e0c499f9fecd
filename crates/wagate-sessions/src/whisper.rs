//! Audio transcription through the OpenAI Whisper API.

use serde::Deserialize;
use wagate_core::error::GatewayError;

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(Clone)]
pub struct Transcriber {
    http: reqwest::Client,
    api_key: String,
}

impl Transcriber {
    /// `None` when no key is configured.
    pub fn from_key(api_key: Option<&str>) -> Option<Self> {
        api_key.filter(|k| !k.is_empty()).map(|k| Self {
            http: reqwest::Client::new(),
            api_key: k.to_string(),
        })
    }

    pub async fn transcribe(&self, audio: &[u8], extension: &str) -> Result<String, GatewayError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(format!("voice.{extension}"))
            .mime_str(&format!("audio/{extension}"))
            .map_err(|e| GatewayError::Media(format!("whisper mime error: {e}")))?;

        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .part("file", part);

        let resp = self
            .http
            .post(WHISPER_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::Media(format!("whisper request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Media(format!(
                "whisper API error {status}: {body}"
            )));
        }

        let result: WhisperResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Media(format!("whisper response parse failed: {e}")))?;

        Ok(result.text.trim().to_string())
    }
}
