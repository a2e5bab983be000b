use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use image::imageops::FilterType;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sketch_loop::codex::resolve_codex_executable;
use sketch_loop::config::SessionConfig;
use sketch_loop::gateway::{wrap_p5, CodexGateway};
use sketch_loop::logging::init_logger;
use sketch_loop::overlay::annotate_regions;
use sketch_loop::pixel_score::{analyze, score_regions};
use sketch_loop::regions::{extract_from_image, RegionParams, RegionSet};
use sketch_loop::render::{ChromeRenderer, RenderContext, Renderer, Viewport};
use sketch_loop::scorer::CodexJudge;
use sketch_loop::session::SessionStatus;
use sketch_loop::store::SessionStore;
use sketch_loop::target::TargetImage;
use sketch_loop::util::{
    abs_path, ensure_parent_dir, out_root, round_to, slugify, timestamp_compact, write_json_pretty,
    write_text_file,
};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "sketch-loop",
    version,
    about = "Drive a vision model toward reproducing a target image as a P5.js sketch"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Extract and consolidate color regions from an image
    Regions(RegionsArgs),
    /// Score a candidate image against a target with the region heuristic
    Compare(CompareArgs),
    /// Render one sketch headlessly and report runtime diagnostics
    Render(RenderArgs),
    /// Run a full generate/render/score session against a target image
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RegionOpts {
    /// Sampling stride in pixels
    #[arg(long)]
    sampling_step: Option<u32>,
    /// Max RGB distance from the seed color within one region
    #[arg(long)]
    color_tolerance: Option<f64>,
    /// Minimum bounding-box area for compact regions
    #[arg(long)]
    min_region_area: Option<u32>,
}

impl RegionOpts {
    fn apply(&self, mut params: RegionParams) -> RegionParams {
        if let Some(step) = self.sampling_step {
            params.sampling_step = step.max(1);
        }
        if let Some(tolerance) = self.color_tolerance {
            params.color_tolerance = tolerance;
        }
        if let Some(area) = self.min_region_area {
            params.min_region_area = area;
        }
        params
    }
}

#[derive(Args, Debug)]
struct RegionsArgs {
    /// Image path
    image: PathBuf,
    /// Skip consolidation and print raw flood-fill regions
    #[arg(long, action = ArgAction::SetTrue)]
    raw: bool,
    /// Also write the JSON to this path
    #[arg(long)]
    json_out: Option<PathBuf>,
    #[command(flatten)]
    region: RegionOpts,
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// Target image path
    target: PathBuf,
    /// Candidate image path
    candidate: PathBuf,
    /// Resize candidate to target size if dimensions differ
    #[arg(long, action = ArgAction::SetTrue)]
    resize: bool,
    /// Write the candidate with scored target regions outlined
    #[arg(long)]
    annotated_out: Option<PathBuf>,
    /// Also write the JSON to this path
    #[arg(long)]
    json_out: Option<PathBuf>,
    #[command(flatten)]
    region: RegionOpts,
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// HTML page, or bare P5.js script (.js)
    sketch: PathBuf,
    /// Output PNG path
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 400)]
    width: u32,
    #[arg(long, default_value_t = 400)]
    height: u32,
    /// Page load timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    /// Override browser executable path
    #[arg(long)]
    chrome_bin: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Target image path
    target: PathBuf,
    /// Session config JSON path (`-` reads stdin)
    #[arg(long)]
    config: Option<String>,
    /// Rounds to run (1-7)
    #[arg(long)]
    max_rounds: Option<u32>,
    /// Stop once a round scores at least this much
    #[arg(long)]
    target_score: Option<f64>,
    /// ten|twenty|hundred
    #[arg(long)]
    score_scale: Option<String>,
    /// pixel|self_critique|judge|composite
    #[arg(long)]
    evaluator: Option<String>,
    /// from_last|from_best
    #[arg(long)]
    branch_policy: Option<String>,
    /// preserve|round
    #[arg(long)]
    rounding: Option<String>,
    /// Extra instructions appended to generation prompts
    #[arg(long)]
    prompt: Option<String>,
    /// Extra instructions appended to judge prompts
    #[arg(long)]
    judge_prompt: Option<String>,
    /// Repair attempts per round
    #[arg(long)]
    repair_attempts: Option<u32>,
    /// Artifact root (default: SKETCH_LOOP_OUT_DIR / .sketch-loop)
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Override Codex executable path
    #[arg(long)]
    codex_bin: Option<String>,
    /// Generator model override
    #[arg(long)]
    model: Option<String>,
    /// Second-opinion judge model (defaults to the generator model)
    #[arg(long)]
    judge_model: Option<String>,
    /// Override browser executable path
    #[arg(long)]
    chrome_bin: Option<String>,
    /// Print the summary without per-round history
    #[arg(long, action = ArgAction::SetTrue)]
    brief: bool,
}

fn main() {
    init_logger();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Regions(args) => command_regions(args),
        Commands::Compare(args) => command_compare(args),
        Commands::Render(args) => command_render(args),
        Commands::Run(args) => command_run(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "regions",
            "description": "Extract consolidated color regions from an image.",
        }),
        json!({
            "name": "compare",
            "description":
                "Score a candidate image against a target and emit correction instructions.",
        }),
        json!({
            "name": "render",
            "description": "Render a P5.js sketch headlessly and report runtime diagnostics.",
        }),
        json!({
            "name": "run",
            "description": "Run a full generate/render/score session with artifact persistence.",
        }),
    ];
    println!("{}", serde_json::to_string_pretty(&json!({ "commands": rows }))?);
    Ok(())
}

fn command_regions(args: RegionsArgs) -> Result<()> {
    let target = TargetImage::open(&args.image)?;
    let params = args.region.apply(RegionParams::default());
    let (width, height) = target.dimensions();
    let set = if args.raw {
        RegionSet {
            width,
            height,
            regions: extract_from_image(target.image(), &params),
        }
    } else {
        analyze(target.image(), &params)
    };

    let result = json!({
        "image": abs_path(&args.image).display().to_string(),
        "size": {"width": width, "height": height},
        "consolidated": !args.raw,
        "params": params,
        "region_count": set.len(),
        "regions": set.regions,
    });
    if let Some(path) = &args.json_out {
        write_json_pretty(path, &result)?;
    }
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn command_compare(args: CompareArgs) -> Result<()> {
    let target = TargetImage::open(&args.target)?;
    let candidate = image::open(&args.candidate)
        .with_context(|| format!("failed to open candidate image: {}", args.candidate.display()))?;

    let (width, height) = target.dimensions();
    let mut resized = false;
    let candidate = if candidate.width() != width || candidate.height() != height {
        if !args.resize {
            bail!("image sizes differ. Re-run with --resize to match target size.");
        }
        resized = true;
        candidate.resize_exact(width, height, FilterType::Lanczos3).to_rgba8()
    } else {
        candidate.to_rgba8()
    };

    let params = args.region.apply(RegionParams::default());
    let target_set = analyze(target.image(), &params);
    let candidate_set = analyze(&candidate, &params);
    let verdict = score_regions(&target_set, &candidate_set);

    if let Some(path) = &args.annotated_out {
        let annotated = annotate_regions(&candidate, &target_set, &verdict);
        ensure_parent_dir(path)?;
        annotated
            .save(path)
            .with_context(|| format!("failed to save annotated image: {}", path.display()))?;
    }

    let result = json!({
        "target": abs_path(&args.target).display().to_string(),
        "candidate": abs_path(&args.candidate).display().to_string(),
        "annotated_image": args.annotated_out.as_deref().map(|p| abs_path(p).display().to_string()),
        "size": {"width": width, "height": height},
        "resized": resized,
        "score": round_to(verdict.score, 3),
        "instructions": verdict.instructions,
        "matches": verdict.matches,
        "target_regions": target_set.regions,
        "candidate_regions": candidate_set.regions,
    });
    if let Some(path) = &args.json_out {
        write_json_pretty(path, &result)?;
    }
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn command_render(args: RenderArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.sketch)
        .with_context(|| format!("failed to read sketch: {}", args.sketch.display()))?;
    let viewport = Viewport {
        width: args.width,
        height: args.height,
    };
    let is_script = args.sketch.extension().and_then(|e| e.to_str()) == Some("js");
    let source = if is_script { wrap_p5(&raw, viewport) } else { raw };
    let timeout = Duration::from_millis(args.timeout_ms.max(1));

    let renderer = ChromeRenderer::new(args.chrome_bin.clone());
    let runtime = build_runtime()?;
    let capture = runtime.block_on(async {
        let mut ctx = renderer.open().await?;
        let result = ctx.capture(&source, viewport, timeout).await;
        ctx.close().await;
        anyhow::Ok(result)
    })??;

    ensure_parent_dir(&args.out)?;
    capture
        .image
        .save(&args.out)
        .with_context(|| format!("failed to save render: {}", args.out.display()))?;

    let result = json!({
        "sketch": abs_path(&args.sketch).display().to_string(),
        "image": abs_path(&args.out).display().to_string(),
        "size": {"width": capture.image.width(), "height": capture.image.height()},
        "clean": capture.is_clean(),
        "has_drawing_surface": capture.has_drawing_surface,
        "uncaught_errors": capture.uncaught_errors,
        "console_errors": capture.console_errors,
        "issues": capture.issues(),
    });
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn command_run(args: RunArgs) -> Result<()> {
    let target = TargetImage::open(&args.target)?;
    let config = build_config(&args)?;

    let codex_bin = resolve_codex_executable(args.codex_bin.as_deref())
        .context("codex executable not found; pass --codex-bin or set SKETCH_LOOP_CODEX")?;
    let gateway = CodexGateway {
        bin: codex_bin.clone(),
        model: args.model.clone(),
        timeout: config.gateway_timeout(),
        retry: config.gateway,
    };
    let judge = CodexJudge {
        bin: codex_bin,
        generator_model: args.model.clone(),
        judge_model: args.judge_model.clone(),
        timeout: config.scoring_timeout(),
    };
    let renderer = ChromeRenderer::new(args.chrome_bin.clone());

    let run_root = args.out_dir.clone().unwrap_or_else(|| {
        let stem = args
            .target
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("target");
        out_root().join("runs").join(format!("{}-{}", timestamp_compact(), slugify(stem)))
    });
    let store = SessionStore::new(Arc::new(gateway), Arc::new(renderer), Arc::new(judge))
        .with_artifacts(&run_root);

    let runtime = build_runtime()?;
    let summary = runtime.block_on(async {
        let id = store.create_session(config, target)?;
        store.start(&id)?;
        store.wait(&id).await
    })?;

    let session_dir = run_root.join(&summary.id);
    if let Some(code) = &summary.best_code {
        write_text_file(&session_dir.join("best.html"), code)?;
    }

    let mut payload = serde_json::to_value(&summary)?;
    if let Value::Object(map) = &mut payload {
        map.insert(
            "session_dir".to_string(),
            Value::String(abs_path(&session_dir).display().to_string()),
        );
        map.remove("best_code");
        if args.brief {
            map.remove("rounds");
        }
    }
    println!("{}", serde_json::to_string_pretty(&payload)?);

    if let SessionStatus::Failed { reason } = &summary.status {
        bail!("session failed: {reason}");
    }
    Ok(())
}

fn build_config(args: &RunArgs) -> Result<SessionConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => SessionConfig::default(),
    };
    if let Some(rounds) = args.max_rounds {
        config.max_rounds = rounds;
    }
    if let Some(score) = args.target_score {
        config.target_score = score;
    }
    if let Some(raw) = &args.score_scale {
        config.score_scale = parse_choice("--score-scale", raw)?;
    }
    if let Some(raw) = &args.evaluator {
        config.evaluator = parse_choice("--evaluator", raw)?;
    }
    if let Some(raw) = &args.branch_policy {
        config.branch_policy = parse_choice("--branch-policy", raw)?;
    }
    if let Some(raw) = &args.rounding {
        config.rounding = parse_choice("--rounding", raw)?;
    }
    if let Some(prompt) = &args.prompt {
        config.custom_prompt = Some(prompt.clone());
    }
    if let Some(prompt) = &args.judge_prompt {
        config.judge_prompt = Some(prompt.clone());
    }
    if let Some(attempts) = args.repair_attempts {
        config.repair.max_attempts = attempts;
    }
    config.validate()?;
    Ok(config)
}

fn load_config(path: &str) -> Result<SessionConfig> {
    let raw = if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read config JSON from stdin")?;
        buf
    } else {
        fs::read_to_string(Path::new(path)).with_context(|| format!("config not found: {path}"))?
    };
    serde_json::from_str(&raw).with_context(|| format!("invalid config JSON: {path}"))
}

fn parse_choice<T: DeserializeOwned>(flag: &str, raw: &str) -> Result<T> {
    let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
    serde_json::from_value(Value::String(normalized))
        .with_context(|| format!("unsupported {flag} value: {raw}"))
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sketch_loop::config::{BranchPolicy, EvaluatorMode};
    use sketch_loop::scorer::{RoundingPolicy, ScoreScale};

    fn run_args(extra: &[&str]) -> RunArgs {
        let argv = ["sketch-loop", "run", "target.png"].into_iter().chain(extra.iter().copied());
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("expected the run command, got {other:?}"),
        }
    }

    #[test]
    fn flags_override_defaults() {
        let config = build_config(&run_args(&[
            "--max-rounds",
            "3",
            "--score-scale",
            "twenty",
            "--target-score",
            "15",
            "--evaluator",
            "composite",
            "--rounding",
            "round",
            "--repair-attempts",
            "1",
            "--prompt",
            "use a dark background",
        ]))
        .unwrap();
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.score_scale, ScoreScale::Twenty);
        assert_eq!(config.target_score, 15.0);
        assert_eq!(config.evaluator, EvaluatorMode::Composite);
        assert_eq!(config.rounding, RoundingPolicy::Round);
        assert_eq!(config.repair.max_attempts, 1);
        assert_eq!(config.custom_prompt.as_deref(), Some("use a dark background"));
    }

    #[test]
    fn choices_accept_dashes_and_any_case() {
        let config = build_config(&run_args(&[
            "--branch-policy",
            "from-best",
            "--evaluator",
            "Self-Critique",
            "--score-scale",
            "ten",
            "--target-score",
            "8",
        ]))
        .unwrap();
        assert_eq!(config.branch_policy, BranchPolicy::FromBest);
        assert_eq!(config.evaluator, EvaluatorMode::SelfCritique);
    }

    #[test]
    fn unknown_choice_names_the_flag() {
        let err = build_config(&run_args(&["--evaluator", "vibes"])).unwrap_err();
        assert_eq!(err.to_string(), "unsupported --evaluator value: vibes");
        assert!(parse_choice::<BranchPolicy>("--branch-policy", "sideways").is_err());
    }

    #[test]
    fn overrides_are_validated() {
        let err = build_config(&run_args(&["--max-rounds", "9"])).unwrap_err();
        assert!(format!("{err:#}").contains("max_rounds must be within 1..=7"));

        // the default target of 85 does not fit a 0-10 scale
        let err = build_config(&run_args(&["--score-scale", "ten"])).unwrap_err();
        assert!(format!("{err:#}").contains("target_score"));
    }

    #[test]
    fn config_file_is_loaded_before_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, r#"{"max_rounds": 2, "branch_policy": "from_best", "history_window": 5}"#)
            .unwrap();
        let path = path.display().to_string();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.max_rounds, 2);
        assert_eq!(loaded.history_window, 5);

        let config = build_config(&run_args(&["--config", &path, "--max-rounds", "4"])).unwrap();
        assert_eq!(config.max_rounds, 4);
        assert_eq!(config.branch_policy, BranchPolicy::FromBest);
        assert_eq!(config.history_window, 5);
    }

    #[test]
    fn unreadable_config_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json").display().to_string();
        assert!(load_config(&missing).unwrap_err().to_string().starts_with("config not found"));

        let garbled = dir.path().join("garbled.json");
        fs::write(&garbled, "{ not json").unwrap();
        let err = load_config(&garbled.display().to_string()).unwrap_err();
        assert!(err.to_string().starts_with("invalid config JSON"));
    }
}
