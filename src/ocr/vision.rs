//! Vision-model register reader (OpenRouter chat completions with an image part).

use super::{decode_candidates, DecodedRows, ImagePayload, MarkReader, ReadError};
use crate::openrouter::{Message, OpenRouterClient};
use tracing::{debug, info};

const USER_INSTRUCTION: &str = "Extract every student row from this register page.";

pub struct VisionMarkReader {
    client: OpenRouterClient,
    prompt: String,
}

impl VisionMarkReader {
    pub fn new(client: OpenRouterClient, prompt: impl Into<String>) -> Self {
        Self {
            client,
            prompt: prompt.into(),
        }
    }
}

#[async_trait::async_trait]
impl MarkReader for VisionMarkReader {
    fn name(&self) -> &str {
        "openrouter_vision"
    }

    async fn read_marks(&self, image: &ImagePayload) -> Result<DecodedRows, ReadError> {
        info!(
            "VisionMarkReader: reading {} ({}, {} bytes) with {}",
            image.filename,
            image.mime_type,
            image.bytes.len(),
            self.client.model()
        );

        let messages = vec![
            Message::system(self.prompt.clone()),
            Message::user_with_image(USER_INSTRUCTION, &image.mime_type, &image.bytes),
        ];

        let response = self
            .client
            .chat(messages)
            .await
            .map_err(ReadError::from_client)?;

        debug!(
            "VisionMarkReader: raw response ({} chars): {}",
            response.len(),
            response.chars().take(500).collect::<String>()
        );

        Ok(decode_candidates(&response)?)
    }
}
