use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Prompt plus the reference images a generation call should carry, in order.
/// The caller supplies the main image separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSpec {
    pub prompt: String,
    pub reference_images: Vec<String>,
}

impl PromptSpec {
    fn from_clauses(clauses: Vec<String>, reference_images: Vec<String>) -> Self {
        Self {
            prompt: clauses
                .into_iter()
                .filter(|clause| !clause.is_empty())
                .collect::<Vec<String>>()
                .join(" "),
            reference_images,
        }
    }
}

/// Which aspect of an image a describe call should narrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeMode {
    Background,
    Clothing,
    General,
}

impl DescribeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Clothing => "clothing",
            Self::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Smile {
    NotSmiling,
    SlightSmile,
    BigSmile,
    #[serde(other)]
    Unknown,
}

/// Structured result of the demographic analysis call. Field names follow the
/// response schema the call requests from the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemographicProfile {
    pub number_of_people: String,
    pub gender: Gender,
    pub age_range: String,
    pub smile: Smile,
    pub is_vietnamese: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackdropColor {
    #[default]
    Auto,
    White,
    Blue,
    Gray,
}

impl BackdropColor {
    fn color_name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::White => "white",
            Self::Blue => "blue",
            Self::Gray => "gray",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestorationSettings {
    pub advanced_prompt: Option<String>,
    pub colorize: bool,
    pub sharpen_background: bool,
    pub high_quality: bool,
    pub vietnamese_subject: bool,
    pub clothing_prompt: Option<String>,
    pub background: BackdropColor,
}

impl RestorationSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        let mut clauses = Vec::new();
        if let Some(advanced) = self.advanced_prompt.as_deref().filter(|p| !p.is_empty()) {
            clauses.push(advanced.to_string());
        } else {
            clauses.push(
                "Restore this old photograph. Improve the quality, sharpen the details, and \
                 repair any damage such as scratches, fading, or stains."
                    .to_string(),
            );
        }
        if self.colorize {
            clauses.push(
                "Colorize the photo naturally and realistically, matching the era of the \
                 original."
                    .to_string(),
            );
        }
        if self.sharpen_background {
            clauses.push("Sharpen both the subject and the background.".to_string());
        }
        if self.high_quality {
            clauses.push(
                "Upscale the photo to the highest possible quality, enhancing detail and \
                 texture."
                    .to_string(),
            );
        }
        if self.vietnamese_subject {
            clauses.push(
                "Note that the subject is Vietnamese so facial features are reconstructed \
                 accurately."
                    .to_string(),
            );
        }
        if let Some(clothing) = self.clothing_prompt.as_deref().filter(|p| !p.is_empty()) {
            clauses.push(format!("Change the attire to: {clothing}."));
        }
        if self.background != BackdropColor::Auto {
            clauses.push(format!(
                "Replace the background with a plain {} backdrop.",
                self.background.color_name()
            ));
        }
        PromptSpec::from_clauses(clauses, Vec::new())
    }

    /// Prefills the analysis-driven fields from a demographic profile.
    pub fn apply_profile(&mut self, profile: &DemographicProfile) {
        self.vietnamese_subject = profile.is_vietnamese;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HairStyle {
    #[default]
    Original,
    Auto,
    Ponytail,
    SlickedBack,
    NeatShort,
    LowBun,
    Bangs,
    Thicken,
}

impl HairStyle {
    fn prompt_clause(&self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::Auto => Some(
                "Automatically style the hair in a neat, professional way suited to an ID photo.",
            ),
            Self::Ponytail => Some("Tie the hair back into a tidy ponytail."),
            Self::SlickedBack => Some("Slick the hair back elegantly."),
            Self::NeatShort => Some("Give the subject a short, neat, professional haircut."),
            Self::LowBun => Some("Gather the hair into an elegant low bun."),
            Self::Bangs => Some("Style the bangs neatly so they do not cover the eyes."),
            Self::Thicken => Some("Make the hair look naturally thicker and fuller."),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdPhotoSettings {
    pub background: BackdropColor,
    pub clothing_prompt: Option<String>,
    pub clothing_reference: Option<String>,
    pub hair_style: HairStyle,
    pub preserve_hair_style: bool,
    pub smooth_skin: bool,
    pub slight_smile: bool,
    pub preserve_face_shape: bool,
    pub preserve_face_details: bool,
    pub custom_prompt: Option<String>,
}

impl IdPhotoSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        let mut clauses = vec![
            "Create a professional, high-quality ID portrait from the original photo.".to_string(),
            format!(
                "The background must be a plain, uniform {} backdrop.",
                match self.background {
                    BackdropColor::Auto | BackdropColor::White => "white",
                    BackdropColor::Blue => "blue",
                    BackdropColor::Gray => "gray",
                }
            ),
            "The subject must face the camera directly with a neutral expression.".to_string(),
        ];

        let mut references = Vec::new();
        if let Some(reference) = self.clothing_reference.as_deref() {
            clauses.push(
                "Replace the subject's attire with the outfit from the second reference image, \
                 accurately and naturally."
                    .to_string(),
            );
            references.push(reference.to_string());
        } else if let Some(clothing) = self.clothing_prompt.as_deref().filter(|p| !p.is_empty()) {
            clauses.push(format!("Attire: {clothing}."));
        } else {
            clauses.push("Keep the subject's original attire.".to_string());
        }

        if let Some(clause) = self.hair_style.prompt_clause() {
            clauses.push(clause.to_string());
        } else if self.preserve_hair_style {
            clauses.push("Preserve the original hairstyle and hair shape exactly.".to_string());
        }

        if self.smooth_skin {
            clauses.push(
                "Smooth the skin naturally, removing minor blemishes while keeping skin \
                 texture."
                    .to_string(),
            );
        }
        if self.slight_smile {
            clauses.push("Add a gentle, natural slight smile.".to_string());
        }
        if let Some(custom) = self.custom_prompt.as_deref().filter(|p| !p.is_empty()) {
            clauses.push(format!("Additional request: {custom}."));
        }
        if self.preserve_face_shape {
            clauses.push(
                "Preserve the face shape, bone structure, and key features exactly.".to_string(),
            );
        }
        if self.preserve_face_details {
            clauses.push(
                "Preserve unique identifying facial details such as moles and small scars."
                    .to_string(),
            );
        }

        PromptSpec::from_clauses(clauses, references)
    }
}

const APERTURE_SCALE: [&str; 11] = [
    "f/16", "f/11", "f/8", "f/5.6", "f/4", "f/3.5", "f/2.8", "f/2.0", "f/1.8", "f/1.4", "f/1.2",
];

#[derive(Debug, Clone, Default)]
pub struct BackgroundSettings {
    pub prompt: String,
    pub reference_image: Option<String>,
    pub lighting_effects: Vec<String>,
    pub lens_blur: u8,
    pub negative_prompt: String,
}

impl BackgroundSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        let mut clauses = vec![
            "IMPORTANT: keep the subject of the original photo exactly as it is (person, \
             objects), including pose, expression, clothing, lighting on the subject, and the \
             overall composition. Only change the background behind the subject."
                .to_string(),
        ];
        let mut references = Vec::new();
        if let Some(reference) = self.reference_image.as_deref() {
            clauses.push("Use the background from the reference image.".to_string());
            references.push(reference.to_string());
        }
        clauses.push(format!("New background description: {}.", self.prompt));
        if !self.lighting_effects.is_empty() {
            clauses.push(format!(
                "Add the following lighting effects: {}.",
                self.lighting_effects.join(", ")
            ));
        }
        if self.lens_blur > 0 {
            let idx = (self.lens_blur as usize).min(APERTURE_SCALE.len() - 1);
            clauses.push(format!(
                "Simulate lens bokeh at an aperture of roughly {}.",
                APERTURE_SCALE[idx]
            ));
        }
        if !self.negative_prompt.is_empty() {
            clauses.push(format!("Negative prompt: {}.", self.negative_prompt));
        }
        PromptSpec::from_clauses(clauses, references)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClothingSettings {
    pub prompt: Option<String>,
    pub reference_image: Option<String>,
    pub color: Option<String>,
}

impl ClothingSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        let mut clauses = vec![
            "Keep the face, hairstyle, pose, and background of the person exactly as they are. \
             Only change their attire."
                .to_string(),
        ];
        let mut references = Vec::new();
        if let Some(reference) = self.reference_image.as_deref() {
            clauses.push("Use the outfit from the reference image.".to_string());
            references.push(reference.to_string());
        }
        if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.is_empty()) {
            clauses.push(format!("New attire description: {prompt}."));
        }
        if let Some(color) = self.color.as_deref().filter(|c| !c.is_empty()) {
            clauses.push(format!("The dominant color of the attire is {color}."));
        }
        PromptSpec::from_clauses(clauses, references)
    }
}

#[derive(Debug, Clone)]
pub struct HairStyleSettings {
    pub prompt: String,
    pub gender: Gender,
}

impl HairStyleSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        let gender = match self.gender {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unspecified",
        };
        PromptSpec {
            prompt: format!(
                "Keep the face, clothing, pose, and background exactly as they are. Only change \
                 the person's hairstyle to: \"{}\". The person's gender is {}.",
                self.prompt, gender
            ),
            reference_images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoseSettings {
    pub pose_prompt: String,
    pub face_reference: Option<String>,
}

impl PoseSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        if let Some(reference) = self.face_reference.as_deref() {
            PromptSpec {
                prompt: format!(
                    "Use the face from the reference image and the body from the original \
                     photo. Change the person's pose to: \"{}\". Keep the original setting \
                     where possible.",
                    self.pose_prompt
                ),
                reference_images: vec![reference.to_string()],
            }
        } else {
            PromptSpec {
                prompt: format!(
                    "Keep the face, clothing, and setting of the person in the original photo. \
                     Only change their pose to: \"{}\".",
                    self.pose_prompt
                ),
                reference_images: Vec::new(),
            }
        }
    }
}

/// Which aspect a free-form edit's reference image illustrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceMode {
    #[default]
    Background,
    Outfit,
}

/// Free-form instruction edit, optionally steered by a reference image.
#[derive(Debug, Clone, Default)]
pub struct EditSettings {
    pub prompt: String,
    pub reference_image: Option<String>,
    pub reference_mode: ReferenceMode,
}

impl EditSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        let mut prompt = self.prompt.clone();
        let mut references = Vec::new();
        if let Some(reference) = self.reference_image.as_deref() {
            let subject = match self.reference_mode {
                ReferenceMode::Background => "setting",
                ReferenceMode::Outfit => "attire",
            };
            prompt.push_str(&format!(
                "\nUse the reference image as inspiration for the {subject}."
            ));
            references.push(reference.to_string());
        }
        PromptSpec {
            prompt,
            reference_images: references,
        }
    }
}

/// Themed baby concept shoot; the concept prompt comes from a picker.
#[derive(Debug, Clone, Default)]
pub struct BabyConceptSettings {
    pub concept_prompt: Option<String>,
}

impl BabyConceptSettings {
    pub fn build_prompt(&self) -> Result<PromptSpec> {
        let Some(concept) = self.concept_prompt.as_deref().filter(|p| !p.trim().is_empty())
        else {
            bail!("a concept must be selected first");
        };
        Ok(PromptSpec {
            prompt: concept.to_string(),
            reference_images: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymmetryAdjustment {
    pub feature: String,
    pub intensity: u8,
}

/// Facial symmetry correction. With no adjustments enabled the image passes
/// through untouched.
#[derive(Debug, Clone, Default)]
pub struct SymmetrySettings {
    pub adjustments: Vec<SymmetryAdjustment>,
}

impl SymmetrySettings {
    pub fn build_prompt(&self) -> Option<PromptSpec> {
        if self.adjustments.is_empty() {
            return None;
        }
        let described = self
            .adjustments
            .iter()
            .map(|adjustment| format!("{} at {}% intensity", adjustment.feature, adjustment.intensity))
            .collect::<Vec<String>>()
            .join(", ");
        Some(PromptSpec {
            prompt: format!(
                "Subtly correct the facial symmetry in this photo. Apply the following \
                 adjustments: {described}. Keep every other detail of the photo unchanged and \
                 preserve the person's identity."
            ),
            reference_images: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LightingSettings {
    pub prompt: String,
}

impl LightingSettings {
    pub fn build_prompt(&self) -> PromptSpec {
        PromptSpec {
            prompt: format!(
                "Keep the subject, clothing, and setting exactly as they are. Only change and \
                 re-render the lighting of the photo according to: \"{}\".",
                self.prompt
            ),
            reference_images: Vec::new(),
        }
    }
}
