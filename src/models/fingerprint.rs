use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Default minimum normalized correlation for a fingerprint to count as present.
pub const DEFAULT_THRESHOLD: f32 = 0.90;

/// Default number of pixels a search region is widened by on every side.
pub const DEFAULT_MATCH_PADDING: u32 = 12;

/// Primary state reported when no primary definition matched.
pub const UNKNOWN_STATE: &str = "UNKNOWN";

/// Axis-aligned pixel rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.w / 2,
            y: self.y + self.h / 2,
        }
    }

    /// Widen by `padding` on every side, then clip to a `width` x `height` frame.
    ///
    /// Returns `None` when nothing of the region lies inside the frame.
    pub fn expand_clamped(&self, padding: u32, width: u32, height: u32) -> Option<Region> {
        let x0 = self.x.saturating_sub(padding);
        let y0 = self.y.saturating_sub(padding);
        let x1 = self
            .x
            .saturating_add(self.w)
            .saturating_add(padding)
            .min(width);
        let y1 = self
            .y
            .saturating_add(self.h)
            .saturating_add(padding)
            .min(height);

        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(Region::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// A tap coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Offset relative to the top-left corner of a matched bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapOffset {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwipeVector {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    #[serde(default = "default_swipe_duration")]
    pub duration_ms: u64,
}

fn default_swipe_duration() -> u64 {
    300
}

/// One entry of the fingerprint registry.
///
/// `region` is already resolved at load time: an explicit `match_region` wins,
/// otherwise the shared region named by `region_ref` is used.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    /// Full dot-path key, e.g. `buttons.yes:end_round`
    pub key: String,
    pub template: Option<Utf8PathBuf>,
    pub region: Option<Region>,
    pub region_ref: Option<String>,
    pub threshold: f32,
    pub padding: u32,
    /// Absolute tap point; overrides the region center
    pub tap: Option<Point>,
    /// Tap point relative to the matched bounding box
    pub tap_offset: Option<TapOffset>,
    pub swipe: Option<SwipeVector>,
    pub roles: Vec<String>,
}

impl Fingerprint {
    /// True when the entry can be evaluated against a frame.
    pub fn is_matchable(&self) -> bool {
        self.template.is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Blind tap point: explicit `tap`, else the center of the region.
    pub fn static_tap_point(&self) -> Option<Point> {
        self.tap.or_else(|| self.region.map(|r| r.center()))
    }

    /// Tap point for a label located at `bbox`.
    pub fn tap_point_for(&self, bbox: Region) -> Point {
        match self.tap_offset {
            Some(offset) => Point {
                x: (bbox.x as i64 + offset.x as i64).max(0) as u32,
                y: (bbox.y as i64 + offset.y as i64).max(0) as u32,
            },
            None => bbox.center(),
        }
    }
}

/// How a state definition participates in classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Mutually exclusive screen; at most one per frame
    Primary,
    Running,
    Menu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StateKind,
    /// Any one of these matching means the state is present
    pub match_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayDefinition {
    pub name: String,
    pub match_keys: Vec<String>,
}

/// Classification of a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionResult {
    pub primary: String,
    pub secondary: Vec<String>,
    pub overlays: Vec<String>,
}

impl DetectionResult {
    pub fn unknown() -> Self {
        Self {
            primary: UNKNOWN_STATE.to_string(),
            secondary: Vec::new(),
            overlays: Vec::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.primary == UNKNOWN_STATE
    }

    pub fn has_secondary(&self, name: &str) -> bool {
        self.secondary.iter().any(|s| s == name)
    }

    pub fn has_overlay(&self, name: &str) -> bool {
        self.overlays.iter().any(|o| o == name)
    }
}

impl Default for DetectionResult {
    fn default() -> Self {
        Self::unknown()
    }
}
