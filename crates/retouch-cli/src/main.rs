use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use retouch_contracts::batch::{BatchTask, TaskStatus};
use retouch_contracts::error::GenerateError;
use retouch_contracts::events::EventLog;
use retouch_contracts::ops::{
    BabyConceptSettings, BackdropColor, BackgroundSettings, ClothingSettings, DescribeMode,
    EditSettings, Gender, HairStyle, HairStyleSettings, IdPhotoSettings, LightingSettings,
    PoseSettings, PromptSpec, ReferenceMode, RestorationSettings, SymmetryAdjustment,
    SymmetrySettings,
};
use retouch_contracts::parts::DataUrl;
use retouch_contracts::prefs::{GenerationConfig, Preferences};
use retouch_engine::{
    run_batch, BatchOptions, DryrunClient, GeminiClient, GenerationClient, VideoOptions,
};

const DEFAULT_PREFS_FILE: &str = "retouch-settings.json";

#[derive(Debug, Parser)]
#[command(name = "retouch", version, about = "AI photo retouching engine")]
struct Cli {
    /// Preference file with model tier, quality, and custom key settings.
    #[arg(long, global = true)]
    prefs: Option<PathBuf>,
    /// Use the offline dry-run client instead of the remote service.
    #[arg(long, global = true)]
    dryrun: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Restore(RestoreArgs),
    IdPhoto(IdPhotoArgs),
    Background(BackgroundArgs),
    Clothing(ClothingArgs),
    Hairstyle(HairstyleArgs),
    Pose(PoseArgs),
    Edit(EditArgs),
    Baby(BabyArgs),
    Symmetry(SymmetryArgs),
    Lighting(LightingArgs),
    Describe(DescribeArgs),
    Analyze(AnalyzeArgs),
    Batch(BatchArgs),
    Video(VideoArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct RestoreArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    colorize: bool,
    #[arg(long)]
    sharpen_background: bool,
    #[arg(long)]
    high_quality: bool,
    #[arg(long)]
    clothing: Option<String>,
    #[arg(long, value_enum, default_value = "auto")]
    background: BackdropArg,
    #[arg(long)]
    advanced_prompt: Option<String>,
    /// Run the demographic analysis first and prefill the settings from it.
    #[arg(long)]
    auto_analyze: bool,
}

#[derive(Debug, Parser)]
struct IdPhotoArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, value_enum, default_value = "white")]
    background: BackdropArg,
    #[arg(long)]
    clothing: Option<String>,
    /// Outfit reference image; wins over --clothing.
    #[arg(long)]
    clothing_reference: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "original")]
    hair_style: HairArg,
    #[arg(long)]
    preserve_hair: bool,
    #[arg(long)]
    smooth_skin: bool,
    #[arg(long)]
    slight_smile: bool,
    #[arg(long)]
    preserve_face_shape: bool,
    #[arg(long)]
    preserve_face_details: bool,
    #[arg(long)]
    custom_prompt: Option<String>,
}

#[derive(Debug, Parser)]
struct BackgroundArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long = "lighting")]
    lighting_effects: Vec<String>,
    /// Bokeh strength from 0 (off) to 10 (widest aperture).
    #[arg(long, default_value_t = 0)]
    lens_blur: u8,
    #[arg(long, default_value = "")]
    negative: String,
}

#[derive(Debug, Parser)]
struct ClothingArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    color: Option<String>,
}

#[derive(Debug, Parser)]
struct HairstyleArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long, value_enum, default_value = "unknown")]
    gender: GenderArg,
}

#[derive(Debug, Parser)]
struct PoseArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    face_reference: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "background")]
    reference_mode: ReferenceModeArg,
}

#[derive(Debug, Parser)]
struct BabyArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    concept: String,
}

#[derive(Debug, Parser)]
struct SymmetryArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// Repeatable `feature=intensity` pairs, e.g. `--adjust eyes=60`.
    #[arg(long = "adjust")]
    adjustments: Vec<String>,
}

#[derive(Debug, Parser)]
struct LightingArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt: String,
}

#[derive(Debug, Parser)]
struct DescribeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, value_enum, default_value = "general")]
    mode: ModeArg,
    #[arg(long, default_value = "en")]
    language: String,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    #[arg(long, default_value_t = 2000)]
    pace_ms: u64,
    #[arg(long)]
    colorize: bool,
    #[arg(long)]
    high_quality: bool,
    /// Analyze each image first and prefill its settings from the result.
    #[arg(long)]
    auto_analyze: bool,
    #[arg(long, default_value = "en")]
    language: String,
}

#[derive(Debug, Parser)]
struct VideoArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "16:9")]
    aspect_ratio: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 10)]
    poll_secs: u64,
    #[arg(long, default_value_t = 60)]
    max_polls: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackdropArg {
    Auto,
    White,
    Blue,
    Gray,
}

impl From<BackdropArg> for BackdropColor {
    fn from(value: BackdropArg) -> Self {
        match value {
            BackdropArg::Auto => Self::Auto,
            BackdropArg::White => Self::White,
            BackdropArg::Blue => Self::Blue,
            BackdropArg::Gray => Self::Gray,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Background,
    Clothing,
    General,
}

impl From<ModeArg> for DescribeMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Background => Self::Background,
            ModeArg::Clothing => Self::Clothing,
            ModeArg::General => Self::General,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HairArg {
    Original,
    Auto,
    Ponytail,
    SlickedBack,
    NeatShort,
    LowBun,
    Bangs,
    Thicken,
}

impl From<HairArg> for HairStyle {
    fn from(value: HairArg) -> Self {
        match value {
            HairArg::Original => Self::Original,
            HairArg::Auto => Self::Auto,
            HairArg::Ponytail => Self::Ponytail,
            HairArg::SlickedBack => Self::SlickedBack,
            HairArg::NeatShort => Self::NeatShort,
            HairArg::LowBun => Self::LowBun,
            HairArg::Bangs => Self::Bangs,
            HairArg::Thicken => Self::Thicken,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GenderArg {
    Male,
    Female,
    Unknown,
}

impl From<GenderArg> for Gender {
    fn from(value: GenderArg) -> Self {
        match value {
            GenderArg::Male => Self::Male,
            GenderArg::Female => Self::Female,
            GenderArg::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReferenceModeArg {
    Background,
    Outfit,
}

impl From<ReferenceModeArg> for ReferenceMode {
    fn from(value: ReferenceModeArg) -> Self {
        match value {
            ReferenceModeArg::Background => Self::Background,
            ReferenceModeArg::Outfit => Self::Outfit,
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("retouch error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = resolve_config(cli.prefs.as_deref(), cli.dryrun)?;
    let client = client_for(cli.dryrun);

    match cli.command {
        Command::Generate(args) => run_generate(client.as_ref(), &config, args),
        Command::Restore(args) => run_restore(client.as_ref(), &config, args),
        Command::IdPhoto(args) => run_id_photo(client.as_ref(), &config, args),
        Command::Background(args) => run_background(client.as_ref(), &config, args),
        Command::Clothing(args) => run_clothing(client.as_ref(), &config, args),
        Command::Hairstyle(args) => run_hairstyle(client.as_ref(), &config, args),
        Command::Pose(args) => run_pose(client.as_ref(), &config, args),
        Command::Edit(args) => run_edit(client.as_ref(), &config, args),
        Command::Baby(args) => run_baby(client.as_ref(), &config, args),
        Command::Symmetry(args) => run_symmetry(client.as_ref(), &config, args),
        Command::Lighting(args) => run_lighting(client.as_ref(), &config, args),
        Command::Describe(args) => run_describe(client.as_ref(), &config, args),
        Command::Analyze(args) => run_analyze(client.as_ref(), &config, args),
        Command::Batch(args) => run_batch_restore(client.as_ref(), &config, args),
        Command::Video(args) => run_video(client.as_ref(), &config, args),
    }
}

fn resolve_config(prefs_path: Option<&Path>, dryrun: bool) -> Result<GenerationConfig> {
    let path = prefs_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFS_FILE));
    let prefs = Preferences::load(&path);
    let ambient = if dryrun {
        Some("dryrun".to_string())
    } else {
        GeminiClient::ambient_api_key()
    };
    prefs
        .resolve(ambient.as_deref())
        .context("set GEMINI_API_KEY or GOOGLE_API_KEY, or a custom key in the preference file")
}

fn client_for(dryrun: bool) -> Box<dyn GenerationClient> {
    if dryrun {
        Box::new(DryrunClient)
    } else {
        Box::new(GeminiClient::new())
    }
}

fn run_generate(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: GenerateArgs,
) -> Result<i32> {
    let main_image = args
        .image
        .as_deref()
        .map(data_url_from_path)
        .transpose()?;
    let references = args
        .references
        .iter()
        .map(|path| data_url_from_path(path))
        .collect::<Result<Vec<String>>>()?;

    let result = client.generate_image(config, &args.prompt, main_image.as_deref(), &references)?;
    let path = write_image_artifact(&args.out, &result)?;
    println!("{}", path.display());
    Ok(0)
}

fn run_restore(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: RestoreArgs,
) -> Result<i32> {
    let image = data_url_from_path(&args.image)?;
    let mut settings = RestorationSettings {
        advanced_prompt: args.advanced_prompt,
        colorize: args.colorize,
        sharpen_background: args.sharpen_background,
        high_quality: args.high_quality,
        clothing_prompt: args.clothing,
        background: args.background.into(),
        ..Default::default()
    };

    if args.auto_analyze {
        let profile = client.analyze_image(config, &image)?;
        eprintln!(
            "analysis: {}",
            serde_json::to_string(&profile).unwrap_or_default()
        );
        settings.apply_profile(&profile);
    }

    let spec = settings.build_prompt();
    let result =
        client.generate_image(config, &spec.prompt, Some(&image), &spec.reference_images)?;
    let path = write_image_artifact(&args.out, &result)?;
    println!("{}", path.display());
    Ok(0)
}

/// Shared tail of the single-image edit subcommands: read the input, run the
/// prompt, write the artifact, print its path.
fn run_prompt_spec(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    image: &Path,
    out: &Path,
    spec: PromptSpec,
) -> Result<i32> {
    let image = data_url_from_path(image)?;
    let result =
        client.generate_image(config, &spec.prompt, Some(&image), &spec.reference_images)?;
    let path = write_image_artifact(out, &result)?;
    println!("{}", path.display());
    Ok(0)
}

fn run_id_photo(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: IdPhotoArgs,
) -> Result<i32> {
    let clothing_reference = args
        .clothing_reference
        .as_deref()
        .map(data_url_from_path)
        .transpose()?;
    let settings = IdPhotoSettings {
        background: args.background.into(),
        clothing_prompt: args.clothing,
        clothing_reference,
        hair_style: args.hair_style.into(),
        preserve_hair_style: args.preserve_hair,
        smooth_skin: args.smooth_skin,
        slight_smile: args.slight_smile,
        preserve_face_shape: args.preserve_face_shape,
        preserve_face_details: args.preserve_face_details,
        custom_prompt: args.custom_prompt,
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt())
}

fn run_background(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: BackgroundArgs,
) -> Result<i32> {
    let reference_image = args.reference.as_deref().map(data_url_from_path).transpose()?;
    let settings = BackgroundSettings {
        prompt: args.prompt,
        reference_image,
        lighting_effects: args.lighting_effects,
        lens_blur: args.lens_blur,
        negative_prompt: args.negative,
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt())
}

fn run_clothing(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: ClothingArgs,
) -> Result<i32> {
    let reference_image = args.reference.as_deref().map(data_url_from_path).transpose()?;
    let settings = ClothingSettings {
        prompt: args.prompt,
        reference_image,
        color: args.color,
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt())
}

fn run_hairstyle(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: HairstyleArgs,
) -> Result<i32> {
    let settings = HairStyleSettings {
        prompt: args.prompt,
        gender: args.gender.into(),
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt())
}

fn run_pose(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: PoseArgs,
) -> Result<i32> {
    let face_reference = args
        .face_reference
        .as_deref()
        .map(data_url_from_path)
        .transpose()?;
    let settings = PoseSettings {
        pose_prompt: args.prompt,
        face_reference,
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt())
}

fn run_edit(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: EditArgs,
) -> Result<i32> {
    let reference_image = args.reference.as_deref().map(data_url_from_path).transpose()?;
    let settings = EditSettings {
        prompt: args.prompt,
        reference_image,
        reference_mode: args.reference_mode.into(),
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt())
}

fn run_baby(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: BabyArgs,
) -> Result<i32> {
    let settings = BabyConceptSettings {
        concept_prompt: Some(args.concept),
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt()?)
}

fn run_symmetry(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: SymmetryArgs,
) -> Result<i32> {
    let settings = SymmetrySettings {
        adjustments: args
            .adjustments
            .iter()
            .map(|raw| parse_adjustment(raw))
            .collect::<Result<Vec<SymmetryAdjustment>>>()?,
    };
    match settings.build_prompt() {
        Some(spec) => run_prompt_spec(client, config, &args.image, &args.out, spec),
        // Nothing enabled: pass the input through unchanged.
        None => {
            let image = data_url_from_path(&args.image)?;
            let path = write_image_artifact(&args.out, &image)?;
            println!("{}", path.display());
            Ok(0)
        }
    }
}

fn run_lighting(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: LightingArgs,
) -> Result<i32> {
    let settings = LightingSettings {
        prompt: args.prompt,
    };
    run_prompt_spec(client, config, &args.image, &args.out, settings.build_prompt())
}

fn parse_adjustment(raw: &str) -> Result<SymmetryAdjustment> {
    let Some((feature, intensity)) = raw.split_once('=') else {
        bail!("adjustment '{raw}' is not in feature=intensity form");
    };
    let feature = feature.trim();
    if feature.is_empty() {
        bail!("adjustment '{raw}' has an empty feature name");
    }
    let intensity: u8 = intensity
        .trim()
        .parse()
        .with_context(|| format!("adjustment '{raw}' has a non-numeric intensity"))?;
    if intensity > 100 {
        bail!("adjustment '{raw}' exceeds 100% intensity");
    }
    Ok(SymmetryAdjustment {
        feature: feature.to_string(),
        intensity,
    })
}

fn run_describe(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: DescribeArgs,
) -> Result<i32> {
    let image = data_url_from_path(&args.image)?;
    let description = client.describe_image(config, &image, args.mode.into(), &args.language)?;
    println!("{description}");
    Ok(0)
}

fn run_analyze(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: AnalyzeArgs,
) -> Result<i32> {
    let image = data_url_from_path(&args.image)?;
    let profile = client.analyze_image(config, &image)?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(0)
}

fn run_batch_restore(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: BatchArgs,
) -> Result<i32> {
    let mut tasks = args
        .images
        .iter()
        .map(|path| Ok(BatchTask::new(data_url_from_path(path)?)))
        .collect::<Result<Vec<BatchTask>>>()?;

    let events = EventLog::new(
        args.out.join("events.jsonl"),
        format!("batch-{}", timestamp_millis()),
    );
    events.record(
        "batch_requested",
        json!({ "images": args.images.len(), "client": client.name() })
            .as_object()
            .cloned()
            .unwrap_or_default(),
    )?;

    let settings = RestorationSettings {
        colorize: args.colorize,
        high_quality: args.high_quality,
        ..Default::default()
    };
    let prepared = if args.auto_analyze {
        analyze_tasks(
            client,
            config,
            &settings,
            &args.language,
            &mut tasks,
            Some(&events),
        )
    } else {
        HashMap::new()
    };
    let options = BatchOptions {
        concurrency: args.concurrency,
        pace: Duration::from_millis(args.pace_ms),
    };

    let outcome = run_batch(
        &mut tasks,
        &options,
        Some(&events),
        |progress| {
            eprintln!(
                "progress: {}/{} ({}%)",
                progress.completed,
                progress.total,
                progress.percent()
            );
        },
        |task| {
            let spec = prepared.get(&task.id).unwrap_or(&settings).build_prompt();
            client.generate_image(config, &spec.prompt, Some(&task.image), &spec.reference_images)
        },
    );

    for (path, task) in args.images.iter().zip(&tasks) {
        match task.status {
            TaskStatus::Done => {
                if let Some(result) = task.result.as_deref() {
                    let artifact = write_image_artifact(&args.out, result)?;
                    println!("{}: {}", path.display(), artifact.display());
                }
            }
            TaskStatus::Error => {
                println!(
                    "{}: error: {}",
                    path.display(),
                    task.error.as_deref().unwrap_or("unknown")
                );
            }
            _ => println!("{}: {}", path.display(), task.status.as_str()),
        }
    }

    match outcome {
        Ok(_) => Ok(0),
        Err(err) => {
            eprintln!("batch halted: {err:#}");
            Ok(1)
        }
    }
}

/// Pre-pass for `batch --auto-analyze`: each eligible task is analyzed and
/// described, and its settings copy prefilled from the result. Tasks that
/// fail analysis are marked `error` (the batch run itself still retries
/// them, with the shared settings).
fn analyze_tasks(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    base: &RestorationSettings,
    language: &str,
    tasks: &mut [BatchTask],
    events: Option<&EventLog>,
) -> HashMap<String, RestorationSettings> {
    let mut prepared = HashMap::new();
    for task in tasks.iter_mut() {
        if !task.eligible() {
            continue;
        }
        task.status = TaskStatus::Analyzing;
        let analyzed = client.analyze_image(config, &task.image).and_then(|profile| {
            let description =
                client.describe_image(config, &task.image, DescribeMode::General, language)?;
            Ok((profile, description))
        });
        match analyzed {
            Ok((profile, description)) => {
                let mut settings = base.clone();
                settings.apply_profile(&profile);
                settings.advanced_prompt = Some(description);
                prepared.insert(task.id.clone(), settings);
                task.status = TaskStatus::Pending;
                record_cli_event(events, "task_analyzed", json!({ "task": task.id.as_str() }));
            }
            Err(err) => {
                task.mark_error(format!("{err:#}"));
                record_cli_event(
                    events,
                    "task_analysis_failed",
                    json!({ "task": task.id.as_str() }),
                );
            }
        }
    }
    prepared
}

fn record_cli_event(events: Option<&EventLog>, kind: &str, payload: serde_json::Value) {
    if let Some(log) = events {
        let payload = payload.as_object().cloned().unwrap_or_default();
        let _ = log.record(kind, payload);
    }
}

fn run_video(
    client: &dyn GenerationClient,
    config: &GenerationConfig,
    args: VideoArgs,
) -> Result<i32> {
    let image = data_url_from_path(&args.image)?;
    let options = VideoOptions {
        aspect_ratio: args.aspect_ratio,
        poll_interval: Duration::from_secs(args.poll_secs),
        max_polls: args.max_polls,
        ..Default::default()
    };

    let outcome = client.generate_video(
        config,
        &image,
        &args.prompt,
        &options,
        &args.out,
        &mut |phrase| eprintln!("{phrase}"),
    );
    match outcome {
        Ok(artifact) => {
            println!("{}", artifact.path.display());
            Ok(0)
        }
        Err(err) => match GenerateError::find_in(&err) {
            Some(GenerateError::SensitivePrompt) => {
                eprintln!("the prompt was rejected as sensitive; rephrase and try again");
                Ok(1)
            }
            Some(GenerateError::Timeout) => {
                eprintln!("the video operation did not finish in time; raise --max-polls");
                Ok(1)
            }
            _ => Err(err),
        },
    }
}

fn data_url_from_path(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = mime_for_path(path).unwrap_or("image/png");
    Ok(DataUrl::encode(mime, &BASE64.encode(bytes)))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => "png",
    }
}

fn write_image_artifact(out_dir: &Path, data_url: &str) -> Result<PathBuf> {
    let parsed = DataUrl::parse(data_url)?;
    let bytes = BASE64
        .decode(parsed.data.as_bytes())
        .context("generated image payload is not valid base64")?;
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(format!(
        "artifact-{}.{}",
        timestamp_millis(),
        extension_for_mime(&parsed.mime)
    ));
    std::fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_detection_covers_common_extensions() {
        assert_eq!(mime_for_path(Path::new("a.png")), Some("image/png"));
        assert_eq!(mime_for_path(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a.webp")), Some("image/webp"));
        assert_eq!(mime_for_path(Path::new("a.txt")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }

    #[test]
    fn artifact_extension_follows_payload_mime() {
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }

    #[test]
    fn file_round_trips_into_a_data_url() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("photo.jpg");
        std::fs::write(&path, b"fake jpeg bytes")?;
        let url = data_url_from_path(&path)?;
        let parsed = DataUrl::parse(&url)?;
        assert_eq!(parsed.mime, "image/jpeg");
        assert_eq!(BASE64.decode(parsed.data.as_bytes())?, b"fake jpeg bytes");
        Ok(())
    }

    #[test]
    fn artifact_writer_decodes_payloads() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let url = DataUrl::encode("image/png", &BASE64.encode(b"png bytes"));
        let path = write_image_artifact(temp.path(), &url)?;
        assert!(path.extension().is_some_and(|ext| ext == "png"));
        assert_eq!(std::fs::read(&path)?, b"png bytes");
        Ok(())
    }

    #[test]
    fn dryrun_config_resolution_never_needs_ambient_keys() -> Result<()> {
        let config = resolve_config(Some(Path::new("/nonexistent/prefs.json")), true)?;
        assert_eq!(config.api_key, "dryrun");
        Ok(())
    }

    #[test]
    fn auto_analyze_prefills_settings_and_returns_tasks_to_pending() -> Result<()> {
        let config = resolve_config(Some(Path::new("/nonexistent/prefs.json")), true)?;
        let base = RestorationSettings::default();
        let mut tasks = vec![
            BatchTask::new(DataUrl::encode("image/png", "AAAA")),
            BatchTask::new("not a data url"),
            BatchTask::new(DataUrl::encode("image/png", "QkJC")),
        ];
        tasks[2].selected = false;

        let prepared = analyze_tasks(&DryrunClient, &config, &base, "en", &mut tasks, None);

        assert_eq!(tasks[0].status, TaskStatus::Pending);
        let settings = prepared.get(&tasks[0].id).expect("prefilled settings");
        assert!(settings.advanced_prompt.as_deref().unwrap_or("").contains("description"));

        assert_eq!(tasks[1].status, TaskStatus::Error);
        assert!(!prepared.contains_key(&tasks[1].id));

        // Deselected tasks are left alone.
        assert_eq!(tasks[2].status, TaskStatus::Pending);
        assert!(!prepared.contains_key(&tasks[2].id));
        Ok(())
    }

    #[test]
    fn prompt_spec_runner_writes_an_artifact() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("photo.png");
        std::fs::write(&input, b"png bytes")?;
        let out = temp.path().join("out");
        let config = resolve_config(Some(Path::new("/nonexistent/prefs.json")), true)?;

        let spec = ClothingSettings {
            prompt: Some("a navy suit".to_string()),
            ..Default::default()
        }
        .build_prompt();
        let code = run_prompt_spec(&DryrunClient, &config, &input, &out, spec)?;
        assert_eq!(code, 0);
        assert_eq!(std::fs::read_dir(&out)?.count(), 1);
        Ok(())
    }

    #[test]
    fn adjustment_parsing_validates_shape_and_range() -> Result<()> {
        let parsed = parse_adjustment("eyes=60")?;
        assert_eq!(parsed.feature, "eyes");
        assert_eq!(parsed.intensity, 60);

        assert!(parse_adjustment("eyes").is_err());
        assert!(parse_adjustment("=60").is_err());
        assert!(parse_adjustment("eyes=lots").is_err());
        assert!(parse_adjustment("eyes=130").is_err());
        Ok(())
    }
}
