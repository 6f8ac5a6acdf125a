//! batchline CLI entrypoint.
//!
//! ```bash
//! batchline run --frames 256 --batch-size 8 --timeout-ms 20
//! batchline run --frames 64 --object-infer --objects-per-frame 3 --json
//! batchline validate --config engine.json --json
//! batchline defaults > engine.json
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use batchline_core::error::{EngineError, Result};
use batchline_core::types::{
    BoundingBox, DetectedObject, Frame, FrameDescriptor, ItemOutcome, PixelFormat,
};
use batchline_pipeline::loopback::{LoopbackDevice, RawCopyPreprocessor, ScorePostprocessor};
use batchline_pipeline::{Collaborators, Engine, EngineConfig, ItemHandle, PipelineMetrics};

#[derive(Parser, Debug)]
#[command(
    name = "batchline",
    version,
    about = "Batching inference scheduler",
    arg_required_else_help = true,
    after_help = "Examples:\n  batchline defaults > engine.json\n  batchline validate --config engine.json --json\n  batchline run --frames 256 --batch-size 8 --timeout-ms 20\n  batchline run --frames 64 --object-infer --objects-per-frame 3 --json\n  batchline run --frames 1000 --frame-delay-ms 5 --progress jsonl"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive synthetic frames through the loopback device.
    Run(RunArgs),
    /// Load and validate an engine config, printing the resolved sizing.
    Validate(ValidateArgs),
    /// Print the default engine config as JSON.
    Defaults,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Optional JSON engine config; flags below override it.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Number of frames to submit before end-of-stream.
    #[arg(long = "frames", default_value_t = 64)]
    frames: u64,

    /// Items per batch.
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    /// Quiescence window before a partial batch is sealed (0 = never).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Worker threads (defaults to the stage count of one batch).
    #[arg(long = "threads")]
    threads: Option<usize>,

    /// Synthetic detections attached to every frame.
    #[arg(long = "objects-per-frame", default_value_t = 2)]
    objects_per_frame: usize,

    /// Infer each detected object instead of the whole frame.
    #[arg(long = "object-infer", default_value_t = false)]
    object_infer: bool,

    /// Infer every Nth frame.
    #[arg(long = "interval")]
    interval: Option<u32>,

    /// Pause between submitted frames.
    #[arg(long = "frame-delay-ms", default_value_t = 0)]
    frame_delay_ms: u64,

    /// Simulated device latency per batch.
    #[arg(long = "invoke-delay-ms", default_value_t = 0)]
    invoke_delay_ms: u64,

    /// Synthetic frame edge length in pixels (RGBA).
    #[arg(long = "frame-size", default_value_t = 8)]
    frame_size: u32,

    /// Emit a JSON summary on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    /// Progress output on stderr.
    #[arg(long = "progress", value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,
}

#[derive(Args, Debug, Clone)]
struct ValidateArgs {
    /// JSON engine config to check.
    #[arg(long = "config")]
    config: PathBuf,

    /// Emit JSON output.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Jsonl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMode {
    Off,
    Human,
    Jsonl,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    schema_version: u32,
    command: &'static str,
    ok: bool,
    cancelled: bool,
    frames: u64,
    items: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    pending: u64,
    batches: u64,
    timeouts: u64,
    elapsed_ms: u64,
}

impl RunSummary {
    fn to_human(&self) -> String {
        format!(
            "run: frames={} items={} succeeded={} failed={} skipped={} batches={} timeouts={} elapsed_ms={}{}",
            self.frames,
            self.items,
            self.succeeded,
            self.failed,
            self.skipped,
            self.batches,
            self.timeouts,
            self.elapsed_ms,
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

struct ProgressReporter {
    notify: Arc<tokio::sync::Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    async fn stop(self) {
        // A stored permit covers a reporter that is between select! rounds.
        self.notify.notify_one();
        let _ = self.handle.await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProgressSnapshot {
    submitted: u64,
    extracted: u64,
    delivered: u64,
}

/// Frames submitted by the feeder and the handles it collected.
struct FeedOutcome {
    frames: u64,
    handles: Vec<ItemHandle>,
    cancelled: bool,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Run(args) if args.json => Some("run"),
        Commands::Validate(args) if args.json => Some("validate"),
        Commands::Defaults => Some("defaults"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Run(args) => build_runtime().and_then(|rt| rt.block_on(run_engine(args))),
        Commands::Validate(args) => run_validate(args),
        Commands::Defaults => run_defaults(),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err.to_string()));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Pipeline(format!("Failed to build tokio runtime: {e}")))
}

fn run_defaults() -> Result<()> {
    println!("{}", EngineConfig::default().to_json_pretty()?);
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let config = EngineConfig::from_json_file(&args.config)?;
    config.validate()?;

    let threads = config.resolved_worker_threads();
    let capacity = config.resolved_queue_capacity();
    if args.json {
        let out = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "validate",
            "ok": true,
            "config": args.config.display().to_string(),
            "batch_size": config.batch_size,
            "batching_timeout_ms": config.batching_timeout_ms,
            "worker_threads": threads,
            "queue_capacity": capacity,
            "infer_interval": config.infer_interval,
            "object_infer": config.object_infer,
        });
        println!("{out}");
    } else {
        println!(
            "validate: ok config={} batch_size={} batching_timeout_ms={} worker_threads={} queue_capacity={}",
            args.config.display(),
            config.batch_size,
            config.batching_timeout_ms,
            threads,
            capacity
        );
    }
    Ok(())
}

fn resolve_run_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.batching_timeout_ms = timeout_ms;
    }
    if let Some(threads) = args.threads {
        config.worker_threads = Some(threads);
    }
    if let Some(interval) = args.interval {
        config.infer_interval = interval;
    }
    if args.object_infer {
        config.object_infer = true;
    }
    config.validate()?;
    Ok(config)
}

async fn run_engine(args: RunArgs) -> Result<()> {
    let config = resolve_run_config(&args)?;
    if args.frame_size == 0 {
        return Err(EngineError::Config("frame-size must be >= 1".into()));
    }

    let descriptor = FrameDescriptor::packed(args.frame_size, args.frame_size, PixelFormat::Rgba32);
    let device = LoopbackDevice::new(descriptor.byte_len())
        .with_invoke_delay(Duration::from_millis(args.invoke_delay_ms));
    let collaborators = Collaborators::new(
        Arc::new(device),
        Arc::new(RawCopyPreprocessor),
        Arc::new(ScorePostprocessor::new()),
    );
    let engine = Arc::new(Engine::new(config, collaborators)?);

    let progress_mode = resolve_progress_mode(args.progress);
    let progress = spawn_progress_reporter("run", progress_mode, engine.metrics().clone());

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping feeder");
                cancel.cancel();
            }
        })
    };

    let start = Instant::now();
    let feeder = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        let args = args.clone();
        tokio::task::spawn_blocking(move || feed_frames(&engine, &args, descriptor, &cancel))
    };
    let outcome = feeder
        .await
        .map_err(|e| EngineError::Pipeline(format!("Feeder task failed: {e}")))??;
    let elapsed = start.elapsed();

    ctrl_c.abort();
    if let Some(reporter) = progress {
        reporter.stop().await;
    }

    if !engine.metrics().validate() {
        return Err(EngineError::InvariantViolation(format!(
            "pipeline counters out of order: {:?}",
            engine.snapshot()
        )));
    }

    let summary = summarize_run(&engine, &outcome, elapsed);
    info!(
        frames = summary.frames,
        items = summary.items,
        failed = summary.failed,
        batches = summary.batches,
        "Run complete"
    );
    if args.json {
        let out = serde_json::to_string(&summary)
            .map_err(|e| EngineError::Pipeline(format!("Failed to encode summary: {e}")))?;
        println!("{out}");
    } else {
        println!("{}", summary.to_human());
    }
    Ok(())
}

/// Submit synthetic frames, then end-of-stream, then wait for every handle.
fn feed_frames(
    engine: &Engine,
    args: &RunArgs,
    descriptor: FrameDescriptor,
    cancel: &CancellationToken,
) -> Result<FeedOutcome> {
    let delay = Duration::from_millis(args.frame_delay_ms);
    let mut handles = Vec::with_capacity(args.frames as usize);
    let mut sent = 0u64;

    for frame_id in 0..args.frames {
        if cancel.is_cancelled() {
            break;
        }
        let frame = synthetic_frame(frame_id, descriptor, args.objects_per_frame);
        handles.push(engine.submit(Arc::new(frame))?);
        sent += 1;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    // EOS seals whatever is still open; timeout 0 relies on it. Delivery is
    // ordered, so the EOS handle completes after every frame before it.
    let eos = engine.submit(Arc::new(Frame::eos("synthetic", sent)))?;
    eos.wait();

    Ok(FeedOutcome {
        frames: sent,
        handles,
        cancelled: cancel.is_cancelled(),
    })
}

fn synthetic_frame(frame_id: u64, descriptor: FrameDescriptor, objects: usize) -> Frame {
    let data = (0..descriptor.byte_len())
        .map(|i| (frame_id as usize).wrapping_mul(31).wrapping_add(i) as u8)
        .collect();
    let detections = (0..objects)
        .map(|i| {
            Arc::new(DetectedObject::new(
                i as i32,
                0.5,
                BoundingBox {
                    x: i as f32,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                },
            ))
        })
        .collect();
    Frame::new("synthetic", frame_id, descriptor, data).with_objects(detections)
}

fn summarize_run(engine: &Engine, outcome: &FeedOutcome, elapsed: Duration) -> RunSummary {
    let (mut succeeded, mut failed, mut skipped, mut pending) = (0u64, 0u64, 0u64, 0u64);
    for item in outcome.handles.iter().flat_map(|h| h.items()) {
        match item.outcome() {
            ItemOutcome::Succeeded => succeeded += 1,
            ItemOutcome::Failed(_) => failed += 1,
            ItemOutcome::Skipped => skipped += 1,
            ItemOutcome::Pending => pending += 1,
        }
    }
    let snapshot = engine.snapshot();
    RunSummary {
        schema_version: JSON_SCHEMA_VERSION,
        command: "run",
        ok: failed == 0 && pending == 0,
        cancelled: outcome.cancelled,
        frames: outcome.frames,
        items: succeeded + failed + skipped + pending,
        succeeded,
        failed,
        skipped,
        pending,
        batches: snapshot.batches_sealed,
        timeouts: snapshot.batches_sealed_by_timeout,
        elapsed_ms: elapsed.as_millis() as u64,
    }
}

fn resolve_progress_mode(progress: ProgressArg) -> ProgressMode {
    match progress {
        ProgressArg::Auto => {
            if std::io::stderr().is_terminal() {
                ProgressMode::Human
            } else {
                ProgressMode::Off
            }
        }
        ProgressArg::Off => ProgressMode::Off,
        ProgressArg::Human => ProgressMode::Human,
        ProgressArg::Jsonl => ProgressMode::Jsonl,
    }
}

fn current_progress_snapshot(metrics: &PipelineMetrics) -> ProgressSnapshot {
    let snap = metrics.snapshot();
    ProgressSnapshot {
        submitted: snap.items_submitted,
        extracted: snap.items_extracted,
        delivered: snap.items_delivered,
    }
}

fn emit_progress_line(
    command: &'static str,
    mode: ProgressMode,
    elapsed: Duration,
    snapshot: ProgressSnapshot,
    final_line: bool,
) {
    // Progress goes to stderr only; stdout carries the summary.
    match mode {
        ProgressMode::Off => {}
        ProgressMode::Human => {
            eprintln!(
                "progress: command={} elapsed_s={:.3} submitted={} extracted={} delivered={} final={}",
                command,
                elapsed.as_secs_f64(),
                snapshot.submitted,
                snapshot.extracted,
                snapshot.delivered,
                final_line
            );
        }
        ProgressMode::Jsonl => {
            let line = json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "type": "progress",
                "command": command,
                "elapsed_ms": elapsed.as_millis() as u64,
                "items": {
                    "submitted": snapshot.submitted,
                    "extracted": snapshot.extracted,
                    "delivered": snapshot.delivered,
                },
                "final": final_line,
            });
            eprintln!("{line}");
        }
    }
}

fn spawn_progress_reporter(
    command: &'static str,
    mode: ProgressMode,
    metrics: Arc<PipelineMetrics>,
) -> Option<ProgressReporter> {
    if matches!(mode, ProgressMode::Off) {
        return None;
    }

    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_task = notify.clone();
    let handle = tokio::spawn(async move {
        let start = Instant::now();
        let mut last = current_progress_snapshot(&metrics);
        loop {
            tokio::select! {
                _ = notify_task.notified() => {
                    let snapshot = current_progress_snapshot(&metrics);
                    emit_progress_line(command, mode, start.elapsed(), snapshot, true);
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let snapshot = current_progress_snapshot(&metrics);
                    if snapshot != last {
                        emit_progress_line(command, mode, start.elapsed(), snapshot, false);
                        last = snapshot;
                    }
                }
            }
        }
    });

    Some(ProgressReporter { notify, handle })
}

fn command_error_json(command: &str, error: &str) -> String {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": error,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_json_escapes_message() {
        let out = command_error_json("validate", "bad \"value\"\n");
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("valid json");
        assert_eq!(parsed["schema_version"], 1);
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"], "bad \"value\"\n");
    }

    #[test]
    fn explicit_progress_modes_ignore_terminal() {
        assert_eq!(resolve_progress_mode(ProgressArg::Off), ProgressMode::Off);
        assert_eq!(resolve_progress_mode(ProgressArg::Human), ProgressMode::Human);
        assert_eq!(resolve_progress_mode(ProgressArg::Jsonl), ProgressMode::Jsonl);
    }

    #[test]
    fn synthetic_frames_match_descriptor() {
        let descriptor = FrameDescriptor::packed(4, 4, PixelFormat::Rgba32);
        let frame = synthetic_frame(3, descriptor, 2);
        assert_eq!(frame.data.len(), 64);
        assert_eq!(frame.objects.len(), 2);
        descriptor.validate(frame.data.len()).expect("frame fits descriptor");
    }

    #[test]
    fn run_flags_override_config() {
        let args = RunArgs::parse_from_args(&[
            "--batch-size",
            "4",
            "--timeout-ms",
            "0",
            "--interval",
            "2",
            "--object-infer",
        ]);
        let config = resolve_run_config(&args).expect("valid config");
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.batching_timeout_ms, 0);
        assert_eq!(config.infer_interval, 2);
        assert!(config.object_infer);
    }

    impl RunArgs {
        fn parse_from_args(extra: &[&str]) -> Self {
            let argv = ["batchline", "run"].iter().chain(extra.iter()).copied();
            match Cli::parse_from(argv).command {
                Commands::Run(args) => args,
                other => panic!("unexpected command: {other:?}"),
            }
        }
    }
}
