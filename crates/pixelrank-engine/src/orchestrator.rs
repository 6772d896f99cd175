//! Candidate acquisition: ordered provider routes, bounded retries with
//! exponential backoff, and a time limit on every provider call.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use image::GenericImageView;
use pixelrank_contracts::config::{seconds, ImageGenerationConfig, ProviderRoute};

use crate::candidate::{Candidate, GenerationRequest, Scores};
use crate::error::AcquisitionFailure;
use crate::providers::{GenerateRequest, GeneratedImage, ImageProvider, ImageProviderRegistry};
use crate::timeout::call_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Calls per route, first try included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ImageGenerationConfig) -> Result<Self> {
        Ok(Self {
            max_attempts: config.retries_per_image.saturating_add(1),
            backoff_base: seconds("image_generation.retry_backoff_s", config.retry_backoff_s)?,
            backoff_max: seconds(
                "image_generation.retry_backoff_max_s",
                config.retry_backoff_max_s,
            )?,
        })
    }

    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base, ...
    /// capped at `backoff_max`.
    pub fn delay_before(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug)]
pub struct Acquired {
    pub candidate: Candidate,
    /// Provider calls spent across all routes, the successful one included.
    pub attempts: u32,
}

struct Route {
    target: ProviderRoute,
    provider: Arc<dyn ImageProvider>,
}

pub struct ProviderOrchestrator {
    routes: Vec<Route>,
    policy: RetryPolicy,
    timeout: Duration,
    max_parallel: usize,
}

impl ProviderOrchestrator {
    pub fn new(config: &ImageGenerationConfig, registry: &ImageProviderRegistry) -> Result<Self> {
        if config.routes.is_empty() {
            bail!("image_generation.routes must list at least one provider");
        }
        let mut routes = Vec::with_capacity(config.routes.len());
        for target in &config.routes {
            let Some(provider) = registry.get(target.provider.trim()) else {
                bail!(
                    "unknown provider '{}' in image_generation.routes (registered: {})",
                    target.provider,
                    registry.names().join(", ")
                );
            };
            routes.push(Route {
                target: ProviderRoute::new(provider.name(), target.model.trim()),
                provider,
            });
        }
        Ok(Self {
            routes,
            policy: RetryPolicy::from_config(config)?,
            timeout: seconds("image_generation.request_timeout_s", config.request_timeout_s)?,
            max_parallel: config.max_parallel.max(1),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn route_labels(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|route| format!("{}:{}", route.target.provider, route.target.model))
            .collect()
    }

    /// Tries every route in order until one yields an image. `index` becomes the
    /// candidate's batch position.
    pub fn acquire(
        &self,
        request: &GenerationRequest,
        index: usize,
    ) -> Result<Acquired, AcquisitionFailure> {
        let request_id = request.id();
        let mut attempts = 0u32;
        let mut last_error = String::from("no provider attempted");

        for route in &self.routes {
            for attempt in 0..self.policy.max_attempts {
                if attempt > 0 {
                    let delay = self.policy.delay_before(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                attempts += 1;
                match self.call_route(route, request) {
                    Ok(generated) => {
                        tracing::debug!(
                            request = %request_id,
                            provider = %route.target.provider,
                            attempts,
                            "candidate acquired"
                        );
                        return Ok(Acquired {
                            candidate: Candidate {
                                index,
                                request_id,
                                image: generated.image,
                                prompt: request.prompt.clone(),
                                provider: route.target.provider.clone(),
                                model: route.target.model.clone(),
                                seed: generated.seed.or(request.seed),
                                scores: Scores::default(),
                            },
                            attempts,
                        });
                    }
                    Err(err) => {
                        last_error = format!("{}: {err:#}", route.target.provider);
                        tracing::warn!(
                            request = %request_id,
                            provider = %route.target.provider,
                            model = %route.target.model,
                            attempt = attempt + 1,
                            max_attempts = self.policy.max_attempts,
                            "provider call failed: {err:#}"
                        );
                    }
                }
            }
            tracing::info!(
                request = %request_id,
                provider = %route.target.provider,
                "retry budget spent, moving to next route"
            );
        }

        Err(AcquisitionFailure {
            request_id,
            attempts,
            last_error,
        })
    }

    /// Acquires every request with at most `max_parallel` calls in flight.
    /// Results come back in request order.
    pub fn acquire_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Vec<Result<Acquired, AcquisitionFailure>> {
        let mut results = Vec::with_capacity(requests.len());
        for (chunk_idx, chunk) in requests.chunks(self.max_parallel).enumerate() {
            let offset = chunk_idx * self.max_parallel;
            thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .enumerate()
                    .map(|(idx, request)| scope.spawn(move || self.acquire(request, offset + idx)))
                    .collect();
                for (handle, request) in handles.into_iter().zip(chunk) {
                    results.push(handle.join().unwrap_or_else(|_| {
                        Err(AcquisitionFailure {
                            request_id: request.id(),
                            attempts: 0,
                            last_error: "acquisition worker panicked".to_string(),
                        })
                    }));
                }
            });
        }
        results
    }

    fn call_route(&self, route: &Route, request: &GenerationRequest) -> Result<GeneratedImage> {
        let provider = Arc::clone(&route.provider);
        let call = GenerateRequest {
            prompt: request.prompt.clone(),
            model: route.target.model.clone(),
            seed: request.seed,
            timeout: self.timeout,
        };
        let label = format!("{} call", route.target.provider);
        let generated = call_with_timeout(&label, self.timeout, move || provider.generate(&call))?;
        let (width, height) = generated.image.dimensions();
        if width == 0 || height == 0 {
            bail!("provider returned an empty {width}x{height} image");
        }
        Ok(generated)
    }
}
