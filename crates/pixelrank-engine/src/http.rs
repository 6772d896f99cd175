//! Blocking HTTP plumbing shared by the hosted providers and scorers.

use std::env;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Collects http(s) URLs found under `url`, `urls`, `images`, `image` and
/// `output`, in document order and without repeats.
pub(crate) fn extract_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if trimmed.starts_with("http") && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "images", "image", "output"] {
                if let Some(nested) = obj.get(key) {
                    extract_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn download_image(
    http: &HttpClient,
    provider: &str,
    url: &str,
    timeout: Duration,
) -> Result<DynamicImage> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .with_context(|| format!("failed downloading {provider} image ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "{provider} image download failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let bytes = response
        .bytes()
        .with_context(|| format!("failed reading {provider} image bytes"))?;
    image::load_from_memory(&bytes)
        .with_context(|| format!("{provider} returned an undecodable image ({url})"))
}

pub(crate) fn png_data_url(image: &DynamicImage) -> Result<String> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .context("failed encoding image as PNG")?;
    Ok(format!(
        "data:image/png;base64,{}",
        BASE64.encode(buffer.into_inner())
    ))
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
