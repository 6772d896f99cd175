use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{GenerateRequest, GeneratedImage, ImageProvider};
use crate::http::{
    api_base_from_env, download_image, extract_urls, non_empty_env, response_json_or_error,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ReplicateProvider {
    api_base: String,
    http: HttpClient,
}

impl ReplicateProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("REPLICATE_API_BASE", "https://api.replicate.com/v1"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY"))
    }

    fn poll_prediction(
        &self,
        poll_url: &str,
        api_key: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Value> {
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .timeout(timeout)
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            match status_of(&payload).as_str() {
                "succeeded" => return Ok(payload),
                "failed" | "canceled" => bail!("Replicate prediction failed: {payload}"),
                _ => {}
            }
            if Instant::now() >= deadline {
                bail!(
                    "Replicate polling timed out after {:.1}s",
                    timeout.as_secs_f64()
                );
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Default for ReplicateProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn status_of(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn prediction_input(request: &GenerateRequest) -> Value {
    let mut input = json!({
        "prompt": request.prompt,
        "output_format": "png",
    });
    if let Some(seed) = request.seed {
        input["seed"] = Value::from(seed);
    }
    input
}

impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let endpoint = format!("{}/predictions", self.api_base);
        let payload = json!({
            "model": request.model.trim(),
            "input": prediction_input(request),
        });
        let deadline = Instant::now() + request.timeout;
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Prefer", "wait")
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        let mut prediction = response_json_or_error("Replicate", response)?;
        match status_of(&prediction).as_str() {
            "succeeded" => {}
            "starting" | "processing" => {
                let poll_url = prediction
                    .get("urls")
                    .and_then(|urls| urls.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("Replicate prediction missing poll URL"))?;
                prediction =
                    self.poll_prediction(&poll_url, &api_key, deadline, request.timeout)?;
            }
            _ => bail!("Replicate prediction failed: {prediction}"),
        }

        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            extract_urls(output, &mut urls);
        }
        let Some(url) = urls.first() else {
            bail!("Replicate response returned no image URLs");
        };
        let image = download_image(&self.http, "Replicate", url, request.timeout)?;
        Ok(GeneratedImage {
            image,
            seed: request.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_carries_seed_only_when_set() {
        let mut request = GenerateRequest {
            prompt: "a fox in snow".to_string(),
            model: "black-forest-labs/flux-schnell".to_string(),
            seed: None,
            timeout: Duration::from_secs(5),
        };
        let unseeded = prediction_input(&request);
        assert_eq!(unseeded["prompt"], "a fox in snow");
        assert!(unseeded.get("seed").is_none());

        request.seed = Some(99);
        assert_eq!(prediction_input(&request)["seed"], 99);
    }

    #[test]
    fn status_is_case_insensitive() {
        assert_eq!(status_of(&json!({"status": "Succeeded"})), "succeeded");
        assert_eq!(status_of(&json!({})), "");
    }
}
