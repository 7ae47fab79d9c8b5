// src/preset.rs
//
// Named presets: concrete settings plus an output filename suffix.

use crate::engine::estimator::{performance_score, profile_performance, ProfilePerformance};
use crate::error::PressError;
use crate::ops::{Anchor, AspectRatio, OutputFormat, TransformSettings};
use serde::{Deserialize, Serialize};

pub const PRESET_NAMES: [&str; 4] = ["ecommerce", "instagram", "linkedin", "web"];

/// A named output flavour of one preset (e.g. feed post vs. story).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetVariant {
    pub name: String,
    pub ratio: AspectRatio,
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub settings: TransformSettings,
    pub suffix: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<PresetVariant>,
}

/// What the pipeline and estimator actually consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPreset {
    pub name: String,
    pub settings: TransformSettings,
    pub suffix: String,
}

impl Preset {
    /// Get preset by name
    pub fn get(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ecommerce" => Some(Preset {
                name: "ecommerce".into(),
                settings: TransformSettings::new()
                    .with_resize(80)
                    .with_crop(AspectRatio::SQUARE, Anchor::Center)
                    .with_convert(OutputFormat::WebP, 85),
                suffix: "_ecommerce".into(),
                variants: Vec::new(),
            }),
            "instagram" => Some(Preset {
                name: "instagram".into(),
                settings: TransformSettings::new()
                    .with_crop(AspectRatio::SQUARE, Anchor::Center)
                    .with_convert(OutputFormat::WebP, 90),
                suffix: "_instagram".into(),
                variants: vec![
                    PresetVariant {
                        name: "post".into(),
                        ratio: AspectRatio::SQUARE,
                        suffix: "_post".into(),
                    },
                    PresetVariant {
                        name: "story".into(),
                        ratio: AspectRatio::STORY,
                        suffix: "_story".into(),
                    },
                ],
            }),
            "linkedin" => Some(Preset {
                name: "linkedin".into(),
                settings: TransformSettings::new()
                    .with_resize(90)
                    .with_crop(AspectRatio::WIDESCREEN, Anchor::Center)
                    .with_convert(OutputFormat::WebP, 90),
                suffix: "_linkedin".into(),
                variants: Vec::new(),
            }),
            "web" => Some(Preset {
                name: "web".into(),
                settings: TransformSettings::new().with_convert(OutputFormat::WebP, 80),
                suffix: "_web".into(),
                variants: Vec::new(),
            }),
            _ => None,
        }
    }

    /// Expected cost and savings of running this preset over `files_count` files.
    pub fn estimate_performance(&self, files_count: usize) -> ProfilePerformance {
        profile_performance(&self.settings, files_count)
    }

    pub fn performance_score(&self) -> u8 {
        performance_score(&self.settings)
    }

    /// Short human summary, e.g. `Resize 80% • Crop 1:1 • WEBP 85%`.
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(resize) = &self.settings.resize {
            parts.push(format!("Resize {}%", resize.percent));
        }
        if let Some(crop) = &self.settings.crop {
            parts.push(format!("Crop {}", crop.ratio.label().replace('/', ":")));
        }
        if let Some(convert) = &self.settings.convert {
            parts.push(format!(
                "{} {}%",
                convert.format.as_str().to_ascii_uppercase(),
                convert.quality
            ));
        }
        if parts.is_empty() {
            "Basic optimization".to_string()
        } else {
            parts.join(" \u{2022} ")
        }
    }

    /// Producing one output per variant is defined but not implemented;
    /// `resolve` only ever honors the first variant.
    pub fn supports_multi_variant(&self) -> bool {
        false
    }

    pub fn resolve(&self) -> ResolvedPreset {
        let mut settings = self.settings;
        let mut suffix = self.suffix.clone();
        if let Some(first) = self.variants.first() {
            if let Some(crop) = settings.crop.as_mut() {
                crop.ratio = first.ratio;
            }
            suffix = first.suffix.clone();
            if self.variants.len() > 1 {
                tracing::debug!(
                    preset = %self.name,
                    honored = %first.name,
                    ignored = self.variants.len() - 1,
                    "multi-variant preset resolved to its first variant"
                );
            }
        }
        ResolvedPreset {
            name: self.name.clone(),
            settings,
            suffix,
        }
    }
}

/// Resolve a preset name into settings + suffix.
pub fn resolve_preset(name: &str) -> Result<ResolvedPreset, PressError> {
    let preset = Preset::get(name).ok_or_else(|| PressError::invalid_preset(name.to_string()))?;
    let resolved = preset.resolve();
    resolved.settings.validate()?;
    Ok(resolved)
}
