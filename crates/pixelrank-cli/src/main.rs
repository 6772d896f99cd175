use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use pixelrank_contracts::config::{ProviderRoute, SelectionConfig};
use pixelrank_contracts::events::EventLog;
use pixelrank_contracts::history::{HistoryEntry, HistoryManifest};
use pixelrank_contracts::runs::summary::{write_summary, SelectionSummary};
use pixelrank_engine::aesthetic::{scorer_from_config, AestheticScorer, HeuristicScorer};
use pixelrank_engine::quality::{self, QualityVerdict};
use pixelrank_engine::{
    default_provider_registry, metrics, phash, sanity, AestheticScore, GenerationRequest,
    SelectionEngine, SelectionOutcome, Winner,
};
use serde_json::{json, Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "pixelrank",
    version,
    about = "Pick one publishable image from a batch of generated candidates"
)]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a batch, rank it and keep the best non-duplicate image.
    Pick(PickArgs),
    /// Print the metrics and verdicts the ranking pipeline would compute.
    Inspect(InspectArgs),
}

#[derive(Debug, Parser)]
struct PickArgs {
    #[arg(long = "prompt")]
    prompts: Vec<String>,
    /// One prompt per line; blank lines and `#` comments are ignored.
    #[arg(long)]
    prompts_file: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    repetitions: Option<usize>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Route every request to the offline `dryrun` provider.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct InspectArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pixelrank error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(fmt::layer().with_writer(std::io::stderr).without_time())
        .try_init();
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Pick(args) => run_pick(args),
        Command::Inspect(args) => {
            run_inspect(args)?;
            Ok(0)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SelectionConfig> {
    match path {
        Some(path) => SelectionConfig::load(path),
        None => Ok(SelectionConfig::default()),
    }
}

fn collect_prompts(inline: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut prompts: Vec<String> = inline
        .iter()
        .map(|prompt| prompt.trim().to_string())
        .filter(|prompt| !prompt.is_empty())
        .collect();
    if let Some(path) = file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading prompts file {}", path.display()))?;
        prompts.extend(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    if prompts.is_empty() {
        bail!("no prompts given (use --prompt or --prompts-file)");
    }
    Ok(prompts)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn run_pick(args: PickArgs) -> Result<i32> {
    let mut config = load_config(args.config.as_deref())?;
    if args.dry_run {
        config.image_generation.routes = vec![ProviderRoute::new("dryrun", "dryrun")];
    }
    if let Some(repetitions) = args.repetitions {
        config.image_generation.repetitions = repetitions;
    }
    config.validate()?;
    let prompts = collect_prompts(&args.prompts, args.prompts_file.as_deref())?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let run_id = format!("run-{}", Uuid::new_v4().simple());
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let manifest = HistoryManifest::new(&config.history.manifest_path);
    let requests = GenerationRequest::expand(
        &prompts,
        config.image_generation.repetitions,
        config.image_generation.base_seed,
    );

    let scorer = scorer_from_config(&config.aesthetic_scoring)?;
    let registry = default_provider_registry();
    let mut engine = SelectionEngine::new(config, &registry, scorer)?
        .with_events(EventLog::new(&events_path, &run_id));

    let started_at = now_utc_iso();
    let result = engine.run(&requests, &manifest);

    let mut extra = Map::new();
    extra.insert("stats".to_string(), serde_json::to_value(engine.last_stats())?);
    extra.insert(
        "events_path".to_string(),
        Value::String(events_path.display().to_string()),
    );
    let (outcome, winner, code) = match &result {
        Ok(SelectionOutcome::Winner(winner)) => {
            let image_path = args.out.join("winner.png");
            let mut record = winner_record(winner);
            match persist_winner(&image_path, &manifest, &run_id, winner) {
                Ok(()) => {
                    println!("{}", image_path.display());
                    record.insert(
                        "image_path".to_string(),
                        Value::String(image_path.display().to_string()),
                    );
                    ("winner", Some(record), 0)
                }
                Err(err) => {
                    eprintln!("pixelrank: {err:#}");
                    extra.insert("error".to_string(), Value::String(format!("{err:#}")));
                    ("persist_failed", Some(record), 1)
                }
            }
        }
        Ok(SelectionOutcome::Exhausted { .. }) => {
            println!("no acceptable winner (duplicates only)");
            ("exhausted", None, 0)
        }
        Err(err) => {
            extra.insert("error".to_string(), Value::String(err.to_string()));
            eprintln!("pixelrank: {err}");
            (err.code(), None, 1)
        }
    };

    let stats = engine.last_stats();
    let summary = SelectionSummary {
        run_id,
        started_at,
        finished_at: now_utc_iso(),
        outcome: outcome.to_string(),
        requested: stats.requested as u64,
        acquired: stats.acquired as u64,
        ranked: stats.ranked as u64,
        winner,
    };
    write_summary(&args.out.join("summary.json"), &summary, Some(&extra))?;
    Ok(code)
}

/// Writes the winning image and records it in the history manifest.
fn persist_winner(
    image_path: &Path,
    manifest: &HistoryManifest,
    run_id: &str,
    winner: &Winner,
) -> Result<()> {
    winner
        .candidate
        .image
        .save(image_path)
        .with_context(|| format!("failed writing {}", image_path.display()))?;
    manifest
        .append(manifest_entry(run_id, winner))
        .with_context(|| {
            format!(
                "failed appending winner to history manifest {}",
                manifest.path().display()
            )
        })
}

fn winner_scores(winner: &Winner) -> Value {
    let scores = &winner.candidate.scores;
    json!({
        "brightness": scores.brightness,
        "entropy": scores.entropy,
        "aesthetic": scores.aesthetic.as_ref().map(AestheticScore::value),
        "aesthetic_degraded": scores.aesthetic.as_ref().is_some_and(AestheticScore::is_degraded),
        "local_quality": scores.local_quality,
        "brightness_norm": scores.brightness_norm,
        "entropy_norm": scores.entropy_norm,
        "final": scores.final_score,
    })
}

fn winner_record(winner: &Winner) -> Map<String, Value> {
    let candidate = &winner.candidate;
    let mut record = Map::new();
    record.insert(
        "candidate_id".to_string(),
        Value::String(candidate.request_id.clone()),
    );
    record.insert("provider".to_string(), Value::String(candidate.provider.clone()));
    record.insert("model".to_string(), Value::String(candidate.model.clone()));
    record.insert("seed".to_string(), json!(candidate.seed));
    record.insert("phash".to_string(), Value::String(winner.fingerprint.to_hex()));
    record.insert("rank".to_string(), json!(winner.rank));
    record.insert("scores".to_string(), winner_scores(winner));
    record
}

fn manifest_entry(run_id: &str, winner: &Winner) -> HistoryEntry {
    let candidate = &winner.candidate;
    let mut extra = Map::new();
    extra.insert("run_id".to_string(), Value::String(run_id.to_string()));
    extra.insert("prompt".to_string(), Value::String(candidate.prompt.clone()));
    extra.insert("provider".to_string(), Value::String(candidate.provider.clone()));
    extra.insert("model".to_string(), Value::String(candidate.model.clone()));
    extra.insert("seed".to_string(), json!(candidate.seed));
    extra.insert("scores".to_string(), winner_scores(winner));
    HistoryEntry {
        id: format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), winner.fingerprint),
        created_at: Some(now_utc_iso()),
        phash: Some(winner.fingerprint.to_hex()),
        extra,
    }
}

fn inspect_image(path: &Path, config: &SelectionConfig) -> Result<Value> {
    let image =
        image::open(path).with_context(|| format!("failed decoding image {}", path.display()))?;
    let brightness = metrics::brightness(&image);
    let entropy = metrics::entropy(&image);
    let sanity = match sanity::floor_violation(brightness, entropy, &config.ranking) {
        None => json!({ "passed": true }),
        Some(reason) => json!({ "passed": false, "reason": reason }),
    };
    let local_quality = match quality::evaluate(&image, &config.local_quality) {
        QualityVerdict::Pass { score } => {
            json!({ "passed": true, "score": score, "enabled": config.local_quality.enabled })
        }
        QualityVerdict::Reject { reason } => {
            json!({ "passed": false, "reason": reason, "enabled": config.local_quality.enabled })
        }
    };
    let aesthetic = HeuristicScorer.score(&image)?;
    Ok(json!({
        "image": path.display().to_string(),
        "width": image.width(),
        "height": image.height(),
        "brightness": brightness,
        "entropy": entropy,
        "sanity": sanity,
        "local_quality": local_quality,
        "heuristic_aesthetic": aesthetic,
        "phash": phash::phash_hex(&image),
    }))
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let report = inspect_image(&args.image, &config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
