use crate::config::{ConfigError, ConfigManager};
use crate::models::{DetectionResult, Fingerprint, Region, StateKind};
use crate::services::matching::{MatchScore, Matcher, TemplateMatcher};
use crate::services::registry::{FingerprintRegistry, StateDefinitions};
use camino::Utf8Path;
use image::GrayImage;
use thiserror::Error;

/// Two or more primary states matched the same frame.
///
/// Always a definition-authoring defect; never resolved automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Multiple primary states matched one frame: {}", states.join(", "))]
pub struct AmbiguousStateError {
    pub states: Vec<String>,
}

/// Failure to resolve a single label in a frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LabelError {
    #[error("No fingerprint named '{0}'")]
    UnknownKey(String),

    #[error("Fingerprint '{0}' has no template to match")]
    NotMatchable(String),

    /// The label is absent above its threshold (a perception miss)
    #[error("'{key}' not visible (confidence {confidence:.3} < {threshold:.2})")]
    Miss {
        key: String,
        confidence: f32,
        threshold: f32,
    },
}

impl LabelError {
    pub fn is_miss(&self) -> bool {
        matches!(self, LabelError::Miss { .. })
    }
}

/// A fingerprint located in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatch {
    pub key: String,
    pub bbox: Region,
    pub confidence: f32,
}

/// Classifies frames against the loaded definitions. Read-only after construction.
pub struct PerceptionEngine {
    registry: FingerprintRegistry,
    definitions: StateDefinitions,
    matcher: Box<dyn Matcher>,
}

impl PerceptionEngine {
    /// Load the registry, definitions and templates from the config directory.
    pub fn load(config: &ConfigManager, template_dir: &Utf8Path) -> Result<Self, ConfigError> {
        let registry = config.load_registry()?;
        let definitions = config.load_state_definitions(&registry)?;
        let matcher = TemplateMatcher::load(&registry, template_dir)?;
        Ok(Self::with_matcher(registry, definitions, Box::new(matcher)))
    }

    pub fn with_matcher(
        registry: FingerprintRegistry,
        definitions: StateDefinitions,
        matcher: Box<dyn Matcher>,
    ) -> Self {
        Self {
            registry,
            definitions,
            matcher,
        }
    }

    pub fn registry(&self) -> &FingerprintRegistry {
        &self.registry
    }

    pub fn definitions(&self) -> &StateDefinitions {
        &self.definitions
    }

    /// Score one fingerprint; `Some` only when it clears its threshold.
    fn hit(&self, frame: &GrayImage, fingerprint: &Fingerprint) -> Option<MatchScore> {
        self.matcher
            .score(frame, fingerprint)
            .filter(|s| s.confidence >= fingerprint.threshold)
    }

    /// First key of an OR-group that matches, with its score.
    fn first_hit<'a>(&self, frame: &GrayImage, keys: &'a [String]) -> Option<(&'a str, MatchScore)> {
        keys.iter().find_map(|key| {
            let fingerprint = self.registry.get(key)?;
            self.hit(frame, fingerprint).map(|s| (key.as_str(), s))
        })
    }

    /// Classify a frame into one primary state, secondary states and overlays.
    pub fn classify(&self, frame: &GrayImage) -> Result<DetectionResult, AmbiguousStateError> {
        let mut result = DetectionResult::unknown();
        let mut primaries = Vec::new();

        for state in self.definitions.states() {
            let Some((key, score)) = self.first_hit(frame, &state.match_keys) else {
                continue;
            };
            tracing::debug!(
                key = key,
                x = score.bbox.x,
                y = score.bbox.y,
                confidence = score.confidence,
                "MATCH state {}",
                state.name
            );
            if state.kind == StateKind::Primary {
                primaries.push(state.name.clone());
            } else {
                result.secondary.push(state.name.clone());
            }
        }

        for overlay in self.definitions.overlays() {
            if let Some((key, score)) = self.first_hit(frame, &overlay.match_keys) {
                tracing::debug!(
                    key = key,
                    x = score.bbox.x,
                    y = score.bbox.y,
                    confidence = score.confidence,
                    "MATCH overlay {}",
                    overlay.name
                );
                result.overlays.push(overlay.name.clone());
            }
        }

        match primaries.len() {
            0 => {}
            1 => result.primary = primaries.remove(0),
            _ => {
                tracing::error!("Ambiguous primary states: {:?}", primaries);
                return Err(AmbiguousStateError { states: primaries });
            }
        }

        Ok(result)
    }

    /// Locate a single label, returning its bounding box.
    pub fn locate(&self, frame: &GrayImage, key: &str) -> Result<LabelMatch, LabelError> {
        let fingerprint = self
            .registry
            .get(key)
            .ok_or_else(|| LabelError::UnknownKey(key.to_string()))?;
        if !fingerprint.is_matchable() {
            return Err(LabelError::NotMatchable(key.to_string()));
        }

        let score = self.matcher.score(frame, fingerprint);
        let confidence = score.map_or(0.0, |s| s.confidence);
        match score {
            Some(s) if s.confidence >= fingerprint.threshold => {
                tracing::debug!(
                    key = key,
                    x = s.bbox.x,
                    y = s.bbox.y,
                    confidence = s.confidence,
                    "MATCH label"
                );
                Ok(LabelMatch {
                    key: key.to_string(),
                    bbox: s.bbox,
                    confidence: s.confidence,
                })
            }
            _ => Err(LabelError::Miss {
                key: key.to_string(),
                confidence,
                threshold: fingerprint.threshold,
            }),
        }
    }

    pub fn is_visible(&self, frame: &GrayImage, key: &str) -> bool {
        self.locate(frame, key).is_ok()
    }
}
