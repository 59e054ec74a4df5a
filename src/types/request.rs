//! Chat request types

use serde::{Deserialize, Serialize};

/// One tagged image attached to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    /// Unique identifier for the image, referenced in the prompt as a tag
    pub img_id: String,
    /// Base64-encoded PNG payload (no data-URI prefix)
    pub base64_img: String,
}

/// A single chat request from a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The user's message text
    pub text: String,
    /// Top-k sampling parameter
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    /// Top-p (nucleus) sampling parameter
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Minimum probability cutoff
    #[serde(default)]
    pub min_p: f32,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Random seed; unset draws one from system entropy
    #[serde(default)]
    pub seed: Option<u32>,
    /// Images to attach to the user turn
    #[serde(default)]
    pub images: Option<Vec<ImageData>>,
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    1.0
}

fn default_temperature() -> f32 {
    0.7
}

impl ChatRequest {
    /// A text-only request with default sampling parameters.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: 0.0,
            temperature: default_temperature(),
            seed: None,
            images: None,
        }
    }
}

/// Engine-facing sampling parameters for one generation
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub seed: Option<u32>,
    /// Unset means generate until the context window or a model stop token
    pub max_tokens: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: 0.0,
            seed: None,
            max_tokens: None,
        }
    }
}

impl From<&ChatRequest> for SamplingParams {
    fn from(request: &ChatRequest) -> Self {
        Self {
            temperature: request.temperature,
            top_k: request.top_k,
            top_p: request.top_p,
            min_p: request.min_p,
            seed: request.seed,
            max_tokens: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: ChatRequest = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(request.text, "hello");
        assert_eq!(request.top_k, 40);
        assert!((request.top_p - 1.0).abs() < f32::EPSILON);
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
        assert!(request.seed.is_none());
        assert!(request.images.is_none());
    }

    #[test]
    fn test_request_with_images() {
        let raw = r#"{
            "text": "what is on this slide?",
            "temperature": 0.2,
            "seed": 7,
            "images": [{"img_id": "slide1", "base64_img": "aGk="}]
        }"#;
        let request: ChatRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.seed, Some(7));
        let images = request.images.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].img_id, "slide1");
    }

    #[test]
    fn test_sampling_params_from_request() {
        let mut request = ChatRequest::text("hi");
        request.min_p = 0.05;
        request.seed = Some(42);

        let params = SamplingParams::from(&request);
        assert!((params.min_p - 0.05).abs() < f32::EPSILON);
        assert_eq!(params.seed, Some(42));
        assert!(params.max_tokens.is_none());
    }
}
