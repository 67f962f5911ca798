use crate::config::ConfigError;
use crate::models::{
    DEFAULT_MATCH_PADDING, DEFAULT_THRESHOLD, Fingerprint, OverlayDefinition, Point, Region,
    StateDefinition, StateKind, SwipeVector, TapOffset, UNKNOWN_STATE,
};
use camino::Utf8PathBuf;
use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Top-level key holding named regions that entries can share through `region_ref`.
pub const SHARED_REGIONS_KEY: &str = "_shared_match_regions";

/// Fields that mark a JSON object as a fingerprint entry rather than a group.
const ENTRY_FIELDS: [&str; 6] = [
    "match_template",
    "match_region",
    "region_ref",
    "tap",
    "swipe",
    "roles",
];

#[derive(Debug, Deserialize)]
struct RawEntry {
    match_template: Option<Utf8PathBuf>,
    match_region: Option<Region>,
    region_ref: Option<String>,
    match_threshold: Option<f32>,
    match_padding: Option<u32>,
    tap: Option<Point>,
    tap_offset: Option<TapOffset>,
    swipe: Option<SwipeVector>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SharedRegion {
    match_region: Region,
}

/// Flattened, immutable view of `clickmap.json`.
///
/// Keys are dot-paths through the JSON groups. Only `.` separates segments, so a
/// key like `buttons.yes:end_round` names the `yes:end_round` entry of `buttons`.
#[derive(Debug, Clone, Default)]
pub struct FingerprintRegistry {
    entries: IndexMap<String, Fingerprint>,
    shared_regions: IndexMap<String, Region>,
}

impl FingerprintRegistry {
    /// Parse and resolve a registry. `source` names the input in error messages.
    pub fn from_json_str(json: &str, source: &str) -> Result<Self, ConfigError> {
        let root: Value = serde_json::from_str(json).map_err(|e| ConfigError::Json {
            context: source.to_string(),
            source: e,
        })?;

        let Value::Object(root) = root else {
            return Err(ConfigError::InvalidEntry {
                key: source.to_string(),
                reason: "top level must be a JSON object".to_string(),
            });
        };

        let shared_regions = parse_shared_regions(&root)?;

        let mut registry = Self {
            entries: IndexMap::new(),
            shared_regions,
        };

        for (name, node) in &root {
            if name == SHARED_REGIONS_KEY {
                continue;
            }
            registry.collect(name.clone(), node)?;
        }

        Ok(registry)
    }

    fn collect(&mut self, path: String, node: &Value) -> Result<(), ConfigError> {
        let Value::Object(map) = node else {
            // Scalars and arrays outside entries are annotations
            return Ok(());
        };

        if ENTRY_FIELDS.iter().any(|f| map.contains_key(*f)) {
            let entry = self.build_entry(&path, node)?;
            self.entries.insert(path, entry);
            return Ok(());
        }

        for (name, child) in map {
            self.collect(format!("{}.{}", path, name), child)?;
        }
        Ok(())
    }

    fn build_entry(&self, key: &str, node: &Value) -> Result<Fingerprint, ConfigError> {
        let raw: RawEntry =
            serde_json::from_value(node.clone()).map_err(|e| ConfigError::InvalidEntry {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let threshold = raw.match_threshold.unwrap_or(DEFAULT_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidEntry {
                key: key.to_string(),
                reason: format!("match_threshold {} is outside [0, 1]", threshold),
            });
        }

        // An explicit region always wins over a shared reference
        let region = match (raw.match_region, raw.region_ref.as_deref()) {
            (Some(region), _) => Some(region),
            (None, Some(name)) => Some(*self.shared_regions.get(name).ok_or_else(|| {
                ConfigError::UnknownRegionRef {
                    key: key.to_string(),
                    region: name.to_string(),
                }
            })?),
            (None, None) => None,
        };

        if region.is_some_and(|r| r.w == 0 || r.h == 0) {
            return Err(ConfigError::InvalidEntry {
                key: key.to_string(),
                reason: "match region has zero size".to_string(),
            });
        }

        Ok(Fingerprint {
            key: key.to_string(),
            template: raw.match_template,
            region,
            region_ref: raw.region_ref,
            threshold,
            padding: raw.match_padding.unwrap_or(DEFAULT_MATCH_PADDING),
            tap: raw.tap,
            tap_offset: raw.tap_offset,
            swipe: raw.swipe,
            roles: raw.roles,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Fingerprint> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Entries tagged with `role`, in file order.
    pub fn entries_by_role(&self, role: &str) -> Vec<&Fingerprint> {
        self.entries.values().filter(|e| e.has_role(role)).collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.entries.values()
    }

    pub fn shared_region(&self, name: &str) -> Option<Region> {
        self.shared_regions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_shared_regions(root: &Map<String, Value>) -> Result<IndexMap<String, Region>, ConfigError> {
    let mut regions = IndexMap::new();
    let Some(node) = root.get(SHARED_REGIONS_KEY) else {
        return Ok(regions);
    };
    let Value::Object(map) = node else {
        return Err(ConfigError::InvalidEntry {
            key: SHARED_REGIONS_KEY.to_string(),
            reason: "expected an object of named regions".to_string(),
        });
    };

    for (name, value) in map {
        let shared: SharedRegion =
            serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidEntry {
                key: format!("{}.{}", SHARED_REGIONS_KEY, name),
                reason: e.to_string(),
            })?;
        regions.insert(name.clone(), shared.match_region);
    }
    Ok(regions)
}

#[derive(Debug, Deserialize)]
struct RawDefinitions {
    #[serde(default)]
    states: Vec<StateDefinition>,
    #[serde(default)]
    overlays: Vec<OverlayDefinition>,
}

/// State and overlay definitions, checked against a registry at load.
#[derive(Debug, Clone, Default)]
pub struct StateDefinitions {
    states: Vec<StateDefinition>,
    overlays: Vec<OverlayDefinition>,
}

impl StateDefinitions {
    pub fn from_yaml_str(
        yaml: &str,
        source: &str,
        registry: &FingerprintRegistry,
    ) -> Result<Self, ConfigError> {
        let raw: RawDefinitions =
            serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Yaml {
                context: source.to_string(),
                source: e,
            })?;
        Self::new(raw.states, raw.overlays, registry)
    }

    /// Validate already-built definitions.
    pub fn new(
        states: Vec<StateDefinition>,
        overlays: Vec<OverlayDefinition>,
        registry: &FingerprintRegistry,
    ) -> Result<Self, ConfigError> {
        let mut state_names = IndexSet::new();
        for state in &states {
            validate_definition(&state.name, &state.match_keys, registry)?;
            if !state_names.insert(state.name.as_str()) {
                return Err(ConfigError::DuplicateDefinition(state.name.clone()));
            }
        }

        let mut overlay_names = IndexSet::new();
        for overlay in &overlays {
            validate_definition(&overlay.name, &overlay.match_keys, registry)?;
            if !overlay_names.insert(overlay.name.as_str()) {
                return Err(ConfigError::DuplicateDefinition(overlay.name.clone()));
            }
        }

        Ok(Self { states, overlays })
    }

    pub fn states(&self) -> &[StateDefinition] {
        &self.states
    }

    pub fn overlays(&self) -> &[OverlayDefinition] {
        &self.overlays
    }

    pub fn primaries(&self) -> impl Iterator<Item = &StateDefinition> {
        self.states.iter().filter(|s| s.kind == StateKind::Primary)
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &StateDefinition> {
        self.states.iter().filter(|s| s.kind != StateKind::Primary)
    }
}

fn validate_definition(
    name: &str,
    keys: &[String],
    registry: &FingerprintRegistry,
) -> Result<(), ConfigError> {
    if name.eq_ignore_ascii_case(UNKNOWN_STATE) {
        return Err(ConfigError::ReservedName(name.to_string()));
    }
    if keys.is_empty() {
        return Err(ConfigError::InvalidEntry {
            key: name.to_string(),
            reason: "definition has no match_keys".to_string(),
        });
    }
    for key in keys {
        let matchable = registry.get(key).is_some_and(Fingerprint::is_matchable);
        if !matchable {
            return Err(ConfigError::UnknownMatchKey {
                definition: name.to_string(),
                key: key.clone(),
            });
        }
    }
    Ok(())
}
