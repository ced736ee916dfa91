use std::collections::VecDeque;
use std::env;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use retouch_contracts::batch::{eligible_indices, BatchProgress, BatchTask};
use retouch_contracts::error::GenerateError;
use retouch_contracts::events::EventLog;
use retouch_contracts::models::{ModelRegistry, HELPER_TEXT_MODEL, PRO_IMAGE_MODEL, VIDEO_MODEL};
use retouch_contracts::ops::{DemographicProfile, DescribeMode};
use retouch_contracts::parts::{assemble_parts, parts_to_wire, DataUrl};
use retouch_contracts::prefs::GenerationConfig;

pub const MAX_RETRIES: usize = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

const VIDEO_PROGRESS_PHRASES: [&str; 4] = [
    "Thinking through the scene...",
    "Rendering frames...",
    "Assembling the clip...",
    "Finalizing the video...",
];

/// Exponential backoff with bounded random jitter: attempt `k` waits
/// `base * 2^k + rand(0..jitter)`. The jitter keeps synchronized clients from
/// retrying in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    /// No waiting at all; used by tests.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponential = self.base.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return exponential;
        }
        exponential + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(1000))
    }
}

/// Runs `attempt_fn` up to `max_attempts` times, sleeping the backoff delay
/// between attempts (never after the last). The first success wins; exhaustion
/// surfaces the last captured error, or `RetriesExhausted` when nothing was
/// ever captured.
pub fn run_with_retries<T>(
    max_attempts: usize,
    backoff: &BackoffPolicy,
    mut attempt_fn: impl FnMut(usize) -> Result<T>,
) -> Result<T> {
    let mut last_error: Option<anyhow::Error> = None;
    for attempt in 0..max_attempts {
        match attempt_fn(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = Some(err);
                if attempt + 1 < max_attempts {
                    thread::sleep(backoff.delay_for(attempt));
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::Error::new(GenerateError::RetriesExhausted)))
}

#[derive(Debug, Clone)]
pub struct VideoOptions {
    pub aspect_ratio: String,
    pub resolution: String,
    pub poll_interval: Duration,
    pub max_polls: usize,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            aspect_ratio: "16:9".to_string(),
            resolution: "720p".to_string(),
            poll_interval: Duration::from_secs(10),
            max_polls: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoArtifact {
    pub path: PathBuf,
}

/// Seam between orchestration and the remote service. `GeminiClient` talks to
/// the real endpoint; `DryrunClient` is the offline stand-in.
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;

    /// One logical generate call: prompt plus optional main and reference
    /// images in, a `data:image/png;base64,...` URL out.
    fn generate_image(
        &self,
        config: &GenerationConfig,
        prompt: &str,
        main_image: Option<&str>,
        reference_images: &[String],
    ) -> Result<String>;

    fn describe_image(
        &self,
        config: &GenerationConfig,
        image: &str,
        mode: DescribeMode,
        language: &str,
    ) -> Result<String>;

    fn analyze_image(&self, config: &GenerationConfig, image: &str) -> Result<DemographicProfile>;

    fn generate_video(
        &self,
        config: &GenerationConfig,
        image: &str,
        prompt: &str,
        options: &VideoOptions,
        out_dir: &Path,
        progress: &mut dyn FnMut(&str),
    ) -> Result<VideoArtifact>;
}

pub struct GeminiClient {
    api_base: String,
    http: HttpClient,
    backoff: BackoffPolicy,
    models: ModelRegistry,
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiClient {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
            backoff: BackoffPolicy::default(),
            models: ModelRegistry::new(None),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_models(mut self, models: ModelRegistry) -> Self {
        self.models = models;
        self
    }

    fn helper_model(&self) -> &str {
        self.models
            .first_for("text")
            .map(|model| model.name.as_str())
            .unwrap_or(HELPER_TEXT_MODEL)
    }

    fn video_model(&self) -> &str {
        self.models
            .first_for("video")
            .map(|model| model.name.as_str())
            .unwrap_or(VIDEO_MODEL)
    }

    pub fn ambient_api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn generate_endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model.trim())
    }

    fn video_start_endpoint(&self) -> String {
        format!(
            "{}/models/{}:predictLongRunning",
            self.api_base,
            self.video_model()
        )
    }

    fn operation_endpoint(&self, operation_name: &str) -> String {
        format!("{}/{}", self.api_base, operation_name.trim_start_matches('/'))
    }

    fn post_json(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<HttpResponse> {
        self.http
            .post(endpoint)
            .query(&[("key", api_key)])
            .timeout(REQUEST_TIMEOUT)
            .json(payload)
            .send()
            .with_context(|| format!("request failed ({endpoint})"))
    }

    fn get_json(&self, endpoint: &str, api_key: &str) -> Result<Value> {
        let response = self
            .http
            .get(endpoint)
            .query(&[("key", api_key)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .with_context(|| format!("request failed ({endpoint})"))?;
        response_json_or_error("operation poll", response)
    }

    fn image_generation_payload(
        config: &GenerationConfig,
        prompt: &str,
        main_image: Option<&str>,
        reference_images: &[String],
    ) -> Result<Value> {
        let parts = assemble_parts(prompt, main_image, reference_images)?;
        let mut generation_config = Map::new();
        generation_config.insert(
            "responseModalities".to_string(),
            json!(["IMAGE", "TEXT"]),
        );
        // The 4K hint only means anything to the pro image model.
        if config.four_k && config.model == PRO_IMAGE_MODEL {
            generation_config.insert("imageConfig".to_string(), json!({ "imageSize": "4K" }));
        }
        Ok(json!({
            "contents": [{
                "role": "user",
                "parts": parts_to_wire(&parts),
            }],
            "generationConfig": Value::Object(generation_config),
        }))
    }

    fn text_payload(image: &str, prompt: &str) -> Result<Value> {
        let parts = assemble_parts(prompt, Some(image), &[])?;
        Ok(json!({
            "contents": [{
                "role": "user",
                "parts": parts_to_wire(&parts),
            }],
        }))
    }

    fn analysis_payload(image: &str) -> Result<Value> {
        let parts = assemble_parts(ANALYSIS_PROMPT, Some(image), &[])?;
        Ok(json!({
            "contents": [{
                "role": "user",
                "parts": parts_to_wire(&parts),
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": demographic_schema(),
            },
        }))
    }

    fn video_start_payload(image: &str, prompt: &str, options: &VideoOptions) -> Result<Value> {
        let parsed = DataUrl::parse(image)?;
        Ok(json!({
            "instances": [{
                "prompt": prompt,
                "image": {
                    "bytesBase64Encoded": parsed.data,
                    "mimeType": parsed.mime,
                },
            }],
            "parameters": {
                "aspectRatio": options.aspect_ratio,
                "resolution": options.resolution,
                "sampleCount": 1,
            },
        }))
    }

    fn download_video(&self, uri: &str, api_key: &str, out_dir: &Path) -> Result<VideoArtifact> {
        let url = download_url_with_key(uri, api_key);
        let response = self
            .http
            .get(&url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .with_context(|| format!("video download request failed ({uri})"))?;
        if !response.status().is_success() {
            let status = response.status().to_string();
            return Err(anyhow::Error::new(GenerateError::Download { status }));
        }
        let bytes = response.bytes().context("failed reading video bytes")?;
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join(format!("clip-{}.mp4", timestamp_millis()));
        std::fs::write(&path, &bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(VideoArtifact { path })
    }
}

impl GenerationClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_image(
        &self,
        config: &GenerationConfig,
        prompt: &str,
        main_image: Option<&str>,
        reference_images: &[String],
    ) -> Result<String> {
        let endpoint = self.generate_endpoint(&config.model);
        let payload =
            Self::image_generation_payload(config, prompt, main_image, reference_images)?;

        run_with_retries(MAX_RETRIES, &self.backoff, |_attempt| {
            let response = self.post_json(&endpoint, &config.api_key, &payload)?;
            let body = response_json_or_error("image generation", response)?;
            classify_image_response(&body)
        })
    }

    fn describe_image(
        &self,
        config: &GenerationConfig,
        image: &str,
        mode: DescribeMode,
        language: &str,
    ) -> Result<String> {
        let endpoint = self.generate_endpoint(self.helper_model());
        let payload = Self::text_payload(image, &describe_prompt(mode, language))?;

        run_with_retries(MAX_RETRIES, &self.backoff, |_attempt| {
            let response = self.post_json(&endpoint, &config.api_key, &payload)?;
            let body = response_json_or_error("image description", response)?;
            let text = first_candidate_text(&body);
            if text.is_empty() {
                bail!("description response contained no text");
            }
            Ok(text)
        })
    }

    fn analyze_image(&self, config: &GenerationConfig, image: &str) -> Result<DemographicProfile> {
        let endpoint = self.generate_endpoint(self.helper_model());
        let payload = Self::analysis_payload(image)?;

        run_with_retries(MAX_RETRIES, &self.backoff, |_attempt| {
            let response = self.post_json(&endpoint, &config.api_key, &payload)?;
            let body = response_json_or_error("image analysis", response)?;
            parse_demographic_profile(&first_candidate_text(&body))
        })
    }

    fn generate_video(
        &self,
        config: &GenerationConfig,
        image: &str,
        prompt: &str,
        options: &VideoOptions,
        out_dir: &Path,
        progress: &mut dyn FnMut(&str),
    ) -> Result<VideoArtifact> {
        progress("Preparing the video request...");
        let payload = Self::video_start_payload(image, prompt, options)?;
        let response = self.post_json(&self.video_start_endpoint(), &config.api_key, &payload)?;
        let started = response_json_or_error("video start", response)
            .map_err(classify_safety_rejection)?;
        let operation_name = started
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("video start response carried no operation name")?;
        let endpoint = self.operation_endpoint(&operation_name);

        let operation = poll_operation(started, options, progress, || {
            self.get_json(&endpoint, &config.api_key)
                .map_err(classify_safety_rejection)
        })?;

        progress("Downloading the video...");
        let uri = resolve_download_uri(&operation)?;
        self.download_video(&uri, &config.api_key, out_dir)
    }
}

/// Offline stand-in that produces deterministic placeholder artifacts, for the
/// CLI `--dryrun` flag and tests.
pub struct DryrunClient;

impl GenerationClient for DryrunClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_image(
        &self,
        _config: &GenerationConfig,
        prompt: &str,
        main_image: Option<&str>,
        reference_images: &[String],
    ) -> Result<String> {
        // Validates the request shape the way the real call would.
        let _ = assemble_parts(prompt, main_image, reference_images)?;
        placeholder_image_data_url(prompt)
    }

    fn describe_image(
        &self,
        _config: &GenerationConfig,
        image: &str,
        mode: DescribeMode,
        language: &str,
    ) -> Result<String> {
        DataUrl::parse(image)?;
        Ok(format!(
            "[dryrun] {} description in {}",
            mode.as_str(),
            language_name(language)
        ))
    }

    fn analyze_image(&self, _config: &GenerationConfig, image: &str) -> Result<DemographicProfile> {
        DataUrl::parse(image)?;
        Ok(DemographicProfile {
            number_of_people: "1".to_string(),
            gender: retouch_contracts::ops::Gender::Unknown,
            age_range: "unknown".to_string(),
            smile: retouch_contracts::ops::Smile::Unknown,
            is_vietnamese: false,
        })
    }

    fn generate_video(
        &self,
        _config: &GenerationConfig,
        image: &str,
        _prompt: &str,
        _options: &VideoOptions,
        out_dir: &Path,
        progress: &mut dyn FnMut(&str),
    ) -> Result<VideoArtifact> {
        DataUrl::parse(image)?;
        for phrase in VIDEO_PROGRESS_PHRASES {
            progress(phrase);
        }
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join(format!("clip-{}.mp4", timestamp_millis()));
        std::fs::write(&path, b"dryrun video placeholder")
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(VideoArtifact { path })
    }
}

/// Polls a long-running operation until its `done` flag flips, sleeping the
/// configured interval between polls and rotating progress phrases through the
/// callback. The poll count is bounded: exceeding `max_polls` is a `Timeout`.
pub fn poll_operation(
    started: Value,
    options: &VideoOptions,
    progress: &mut dyn FnMut(&str),
    mut poll_fn: impl FnMut() -> Result<Value>,
) -> Result<Value> {
    let mut operation = started;
    let mut polls = 0usize;
    while !operation
        .get("done")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        if polls >= options.max_polls {
            return Err(anyhow::Error::new(GenerateError::Timeout));
        }
        progress(VIDEO_PROGRESS_PHRASES[polls % VIDEO_PROGRESS_PHRASES.len()]);
        thread::sleep(options.poll_interval);
        operation = poll_fn()?;
        polls += 1;
    }
    Ok(operation)
}

/// Inspects one generation response the way callers expect: first candidate
/// only, first inline image part wins; a text answer without an image is a
/// classified failure, and an empty response is another.
pub fn classify_image_response(body: &Value) -> Result<String> {
    let parts = first_candidate_parts(body);
    for part in &parts {
        if let Some(data) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(|inline| inline.get("data"))
            .and_then(Value::as_str)
            .filter(|data| !data.is_empty())
        {
            return Ok(DataUrl::encode("image/png", data));
        }
    }
    for part in &parts {
        if let Some(text) = part
            .get("text")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
        {
            return Err(anyhow::Error::new(GenerateError::TextOnly(
                text.trim().to_string(),
            )));
        }
    }
    Err(anyhow::Error::new(GenerateError::NoImage))
}

fn first_candidate_parts(body: &Value) -> Vec<Value> {
    body.get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn first_candidate_text(body: &Value) -> String {
    first_candidate_parts(body)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("")
        .trim()
        .to_string()
}

const ANALYSIS_PROMPT: &str = "Analyze the provided image and return a JSON object describing \
the demographics of the main subject(s).\n\
- numberOfPeople: estimated head count as a string (for example '1', '2', '3-5').\n\
- gender: perceived gender of the main subject ('male', 'female', or 'unknown'). With several \
people, focus on the most prominent one or default to 'unknown'.\n\
- ageRange: an estimated age bracket string (for example '20-30', '51+').\n\
- smile: the main subject's smile ('not_smiling', 'slight_smile', 'big_smile', or 'unknown').\n\
- isVietnamese: a boolean indicating whether the subjects appear to be Vietnamese.\n\
Return only the JSON object.";

fn demographic_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "numberOfPeople": { "type": "STRING", "description": "Number of people in the photo" },
            "gender": { "type": "STRING", "description": "Perceived gender of the main subject" },
            "ageRange": { "type": "STRING", "description": "Estimated age bracket" },
            "smile": { "type": "STRING", "description": "Perceived smile" },
            "isVietnamese": { "type": "BOOLEAN", "description": "Whether the subjects appear Vietnamese" },
        },
        "required": ["numberOfPeople", "gender", "ageRange", "smile", "isVietnamese"],
    })
}

/// Models fence JSON answers in Markdown more often than not; strip the fence
/// before parsing.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

pub fn parse_demographic_profile(raw: &str) -> Result<DemographicProfile> {
    let stripped = strip_code_fences(raw);
    if stripped.is_empty() {
        return Err(anyhow::Error::new(GenerateError::EmptyAnalysis));
    }
    serde_json::from_str(&stripped).map_err(|err| {
        anyhow::Error::new(GenerateError::MalformedAnalysis(err.to_string()))
    })
}

const LANGUAGE_NAMES: [(&str, &str); 13] = [
    ("vi", "Vietnamese"),
    ("en", "English"),
    ("zh", "Chinese"),
    ("hi", "Hindi"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("ar", "Arabic"),
    ("bn", "Bengali"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("th", "Thai"),
    ("lo", "Lao"),
    ("km", "Cambodian"),
];

pub fn language_name(code: &str) -> &'static str {
    let primary = code.split('-').next().unwrap_or_default().trim();
    LANGUAGE_NAMES
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(primary))
        .map(|(_, name)| *name)
        .unwrap_or("Vietnamese")
}

pub fn describe_prompt(mode: DescribeMode, language: &str) -> String {
    let output_language = language_name(language);
    match mode {
        DescribeMode::Background => format!(
            "Describe the background of this image in {output_language} in great detail, like \
             an art critic or a high-end generation prompt. Describe the shapes, geometry, \
             textures, lighting style, and atmosphere. Do not mention the subject or person; \
             focus strictly on the environment."
        ),
        DescribeMode::Clothing => format!(
            "Analyze this image and provide a short, concise description in {output_language} \
             of the person's attire. Detail the type of clothing, color, style, and material. \
             Do NOT describe the person, background, or any text or logos in the image. The \
             description must be suitable for use as a clothing change prompt and strictly \
             limited to 30 words."
        ),
        DescribeMode::General => format!(
            "Thoroughly analyze this image and respond in {output_language}. Describe in \
             detail the gender, attire (including style and material if possible), dominant \
             colors of the attire, and the surrounding context. After the description, append \
             these restoration requests: 'Refresh and improve the overall quality of the \
             photo. Remove all imperfections such as scratches, stains, dust, and smudges. \
             Adjust color and contrast to make the photo vibrant, sharp, and look like new.'"
        ),
    }
}

fn download_url_with_key(uri: &str, api_key: &str) -> String {
    if uri.contains('?') {
        format!("{uri}&key={api_key}")
    } else {
        format!("{uri}?key={api_key}")
    }
}

/// Pulls the signed download URI out of a finished video operation. A missing
/// URI with safety-flagged error text is a sensitive-prompt rejection.
pub fn resolve_download_uri(operation: &Value) -> Result<String> {
    let response = operation.get("response").cloned().unwrap_or(Value::Null);
    let samples = response
        .get("generateVideoResponse")
        .and_then(|inner| inner.get("generatedSamples"))
        .or_else(|| response.get("generatedVideos"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for sample in samples {
        if let Some(uri) = sample
            .get("video")
            .and_then(|video| video.get("uri"))
            .and_then(Value::as_str)
            .filter(|uri| !uri.is_empty())
        {
            return Ok(uri.to_string());
        }
    }

    let error_message = operation
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if is_safety_message(error_message) {
        return Err(anyhow::Error::new(GenerateError::SensitivePrompt));
    }
    bail!(
        "video operation finished without a download link{}",
        if error_message.is_empty() {
            String::new()
        } else {
            format!(": {}", truncate_text(error_message, 512))
        }
    )
}

fn is_safety_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("sensitive") || lowered.contains("safety")
}

fn classify_safety_rejection(err: anyhow::Error) -> anyhow::Error {
    if is_safety_message(&err.to_string()) {
        return anyhow::Error::new(GenerateError::SensitivePrompt);
    }
    err
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{label} failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{label} returned invalid JSON"))
}

fn placeholder_image_data_url(prompt: &str) -> Result<String> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = image::RgbImage::new(64, 64);
    for pixel in canvas.pixels_mut() {
        *pixel = image::Rgb([r, g, b]);
    }
    let mut bytes = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(canvas)
        .write_to(&mut bytes, image::ImageFormat::Png)
        .context("failed to encode placeholder image")?;
    Ok(DataUrl::encode("image/png", &BASE64.encode(bytes.into_inner())))
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut acc: [u8; 3] = [0x3c, 0x5a, 0x78];
    for (idx, byte) in prompt.bytes().enumerate() {
        acc[idx % 3] = acc[idx % 3].wrapping_mul(31).wrapping_add(byte);
    }
    (acc[0], acc[1], acc[2])
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub pace: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            pace: Duration::from_millis(2000),
        }
    }
}

/// Runs the eligible tasks through `per_task` with a fixed pool of workers.
///
/// Each worker pops the next queued task, flips it to `processing`, runs the
/// per-task function, and records `done` or `error`. The completed counter
/// only advances on success, and a failing task stops the worker that ran it
/// without touching what other workers already finished; queued tasks that
/// worker would have reached stay `pending`. With the default concurrency of 1
/// that makes a single failure halt the rest of the run.
pub fn run_batch<F, P>(
    tasks: &mut Vec<BatchTask>,
    options: &BatchOptions,
    events: Option<&EventLog>,
    on_progress: P,
    per_task: F,
) -> Result<BatchProgress>
where
    F: Fn(&BatchTask) -> Result<String> + Sync,
    P: Fn(BatchProgress) + Sync,
{
    if options.concurrency == 0 {
        bail!("batch concurrency must be at least 1");
    }

    let queue: VecDeque<usize> = eligible_indices(tasks).into();
    let total = queue.len();
    if total == 0 {
        return Ok(BatchProgress::new(0));
    }
    record_event(
        events,
        "batch_started",
        json!({ "total": total, "concurrency": options.concurrency }),
    );

    let queue = Mutex::new(queue);
    let shared = Mutex::new(&mut *tasks);
    let completed = AtomicUsize::new(0);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    thread::scope(|scope| {
        for _ in 0..options.concurrency {
            scope.spawn(|| loop {
                let Some(idx) = lock_or_recover(&queue).pop_front() else {
                    break;
                };
                let snapshot = {
                    let mut tasks = lock_or_recover(&shared);
                    tasks[idx].mark_processing();
                    tasks[idx].clone()
                };
                record_event(events, "task_started", json!({ "task": snapshot.id.as_str() }));

                match per_task(&snapshot) {
                    Ok(result) => {
                        lock_or_recover(&shared)[idx].mark_done(result);
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        let progress = BatchProgress {
                            total,
                            completed: done,
                        };
                        record_event(
                            events,
                            "task_finished",
                            json!({
                                "task": snapshot.id.as_str(),
                                "completed": done,
                                "total": total,
                                "percent": progress.percent(),
                            }),
                        );
                        on_progress(progress);
                    }
                    Err(err) => {
                        let message = error_chain_text(&err, 512);
                        lock_or_recover(&shared)[idx].mark_error(&message);
                        record_event(
                            events,
                            "task_failed",
                            json!({ "task": snapshot.id.as_str(), "error": message }),
                        );
                        let mut slot = lock_or_recover(&first_error);
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        break;
                    }
                }

                let more_queued = !lock_or_recover(&queue).is_empty();
                if more_queued && !options.pace.is_zero() {
                    thread::sleep(options.pace);
                }
            });
        }
    });

    let final_progress = BatchProgress {
        total,
        completed: completed.load(Ordering::SeqCst),
    };
    record_event(
        events,
        "batch_finished",
        json!({
            "completed": final_progress.completed,
            "total": final_progress.total,
            "percent": final_progress.percent(),
        }),
    );

    if let Some(err) = lock_or_recover(&first_error).take() {
        return Err(err).context("batch run halted on task failure");
    }
    Ok(final_progress)
}

/// Re-runs exactly one task through the same runner (same pacing and failure
/// semantics), even if it already finished.
pub fn regenerate_task<F, P>(
    tasks: &mut [BatchTask],
    task_id: &str,
    options: &BatchOptions,
    events: Option<&EventLog>,
    on_progress: P,
    per_task: F,
) -> Result<BatchProgress>
where
    F: Fn(&BatchTask) -> Result<String> + Sync,
    P: Fn(BatchProgress) + Sync,
{
    let Some(pos) = tasks.iter().position(|task| task.id == task_id) else {
        bail!("no task with id '{task_id}'");
    };
    tasks[pos].reset_for_regenerate();
    let mut single = vec![tasks[pos].clone()];
    let outcome = run_batch(&mut single, options, events, on_progress, per_task);
    tasks[pos] = single.remove(0);
    outcome
}

fn record_event(events: Option<&EventLog>, kind: &str, payload: Value) {
    if let Some(log) = events {
        let payload = payload.as_object().cloned().unwrap_or_default();
        // Telemetry must never fail the run it describes.
        let _ = log.record(kind, payload);
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
