//! Gateway request and response types
//!
//! Shapes follow the local inference service's HTTP API: generate,
//! embeddings, tags and show.

use serde::{Deserialize, Serialize};

/// Sampling parameters for a generation request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Token budget for the completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop: Vec<String>,
}

/// A finished completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub done_reason: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_duration_ms: u64,
}

/// One frame of a streaming generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateChunk {
    pub text: String,
    pub done: bool,
}

/// Service health probe result
#[derive(Debug, Clone)]
pub struct Health {
    pub healthy: bool,
    pub latency: std::time::Duration,
    pub models: usize,
}

/// One installed model
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

// Wire shapes

#[derive(Debug, Serialize)]
pub(crate) struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<WireOptions>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop: Vec<String>,
}

impl GenerateParams {
    pub(crate) fn to_wire(&self) -> Option<WireOptions> {
        if *self == Self::default() {
            return None;
        }
        Some(WireOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            num_predict: self.max_tokens,
            stop: self.stop.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateFrame {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    /// Nanoseconds
    #[serde(default)]
    pub total_duration: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmbeddingsRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingsResponse {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_omit_options() {
        assert!(GenerateParams::default().to_wire().is_none());

        let params = GenerateParams {
            temperature: Some(0.2),
            ..Default::default()
        };
        let wire = params.to_wire().unwrap();
        assert_eq!(wire.temperature, Some(0.2));
    }

    #[test]
    fn test_generate_request_serialization() {
        let request = GenerateRequest {
            model: "llama3.1",
            prompt: "hello",
            stream: false,
            options: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama3.1");
        assert!(json.get("options").is_none());
    }

    #[test]
    fn test_generate_frame_parsing() {
        let frame: GenerateFrame =
            serde_json::from_str(r#"{"model":"m","response":"hi","done":false}"#).unwrap();
        assert_eq!(frame.response, "hi");
        assert!(!frame.done);

        let terminal: GenerateFrame = serde_json::from_str(
            r#"{"model":"m","response":"","done":true,"done_reason":"stop","eval_count":7,"total_duration":1500000}"#,
        )
        .unwrap();
        assert!(terminal.done);
        assert_eq!(terminal.eval_count, Some(7));
    }
}
