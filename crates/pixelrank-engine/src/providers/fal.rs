use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};

use super::{GenerateRequest, GeneratedImage, ImageProvider};
use crate::http::{
    api_base_from_env, download_image, extract_urls, non_empty_env, response_json_or_error,
};

pub struct FalProvider {
    api_base: String,
    http: HttpClient,
}

impl FalProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("FAL_API_BASE", "https://fal.run"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("FAL_KEY").or_else(|| non_empty_env("FAL_API_KEY"))
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.trim();
        if model.starts_with("http://") || model.starts_with("https://") {
            return model.to_string();
        }
        format!("{}/{}", self.api_base, model.trim_start_matches('/'))
    }
}

impl Default for FalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for FalProvider {
    fn name(&self) -> &str {
        "fal"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let Some(api_key) = Self::api_key() else {
            bail!("FAL_KEY (or FAL_API_KEY) not set");
        };
        let endpoint = self.endpoint(&request.model);
        let mut payload = json!({
            "prompt": request.prompt,
            "num_images": 1,
        });
        if let Some(seed) = request.seed {
            payload["seed"] = Value::from(seed);
        }

        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Fal request failed ({endpoint})"))?;
        let body = response_json_or_error("Fal", response)?;
        let mut urls = Vec::new();
        extract_urls(&body, &mut urls);
        let Some(url) = urls.first() else {
            bail!("Fal response returned no image URLs");
        };
        let image = download_image(&self.http, "Fal", url, request.timeout)?;
        Ok(GeneratedImage {
            image,
            seed: body.get("seed").and_then(Value::as_i64).or(request.seed),
        })
    }
}
