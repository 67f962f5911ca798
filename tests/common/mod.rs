//! Shared stubs for the integration tests.
//!
//! Frames are tiny grayscale images whose pixel (0, 0) carries a scene id. The
//! [`SceneMatcher`] maps each scene id to the confidence of every fingerprint, so a
//! test scripts what the screen "shows" as a list of scene ids.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{GrayImage, Luma};
use indexmap::IndexMap;
use screenpilot::Metrics;
use screenpilot::models::{Fingerprint, Region};
use screenpilot::services::{
    DeviceError, DeviceExecutor, FingerprintRegistry, Frame, FrameSource, ImmediateInput,
    MatchScore, Matcher, PerceptionEngine, StateDefinitions,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const CLICKMAP: &str = r#"{
    "_shared_match_regions": {
        "bottom_bar": {"match_region": {"x": 0, "y": 1800, "w": 1080, "h": 120}}
    },
    "screens": {
        "home": {"match_template": "screens/home.png"},
        "battle": {"match_template": "screens/battle.png"},
        "game_over": {"match_template": "screens/game_over.png"}
    },
    "indicators": {
        "running": {"match_template": "indicators/running.png", "match_threshold": 0.85}
    },
    "buttons": {
        "ability": {"match_template": "buttons/ability.png", "tap_offset": {"x": 5, "y": 5}},
        "battle:home": {"match_template": "buttons/battle.png", "region_ref": "bottom_bar"},
        "retry:game_over": {"match_template": "buttons/retry.png"},
        "close_menu": {"match_template": "buttons/close.png"}
    },
    "labels": {
        "boss": {"match_template": "labels/boss.png"}
    },
    "overlays": {
        "menu": {"match_template": "overlays/menu.png"}
    }
}"#;

pub const DEFINITIONS: &str = r#"
states:
  - name: HOME_SCREEN
    type: primary
    match_keys: [screens.home]
  - name: BATTLE
    type: primary
    match_keys: [screens.battle]
  - name: GAME_OVER
    type: primary
    match_keys: [screens.game_over]
  - name: RUNNING
    type: running
    match_keys: [indicators.running]
overlays:
  - name: MENU_OPEN
    match_keys: [overlays.menu]
"#;

/// Where every hit lands; tap points derive from it.
pub const HIT_BOX: Region = Region {
    x: 100,
    y: 200,
    w: 40,
    h: 20,
};

pub fn registry() -> FingerprintRegistry {
    FingerprintRegistry::from_json_str(CLICKMAP, "clickmap.json").unwrap()
}

/// Confidence per fingerprint key for each scene id.
#[derive(Default, Clone)]
pub struct SceneMatcher {
    scenes: IndexMap<u8, IndexMap<String, f32>>,
}

impl SceneMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scene `id` shows each listed key at the given confidence; everything else scores 0.
    pub fn scene(mut self, id: u8, hits: &[(&str, f32)]) -> Self {
        self.scenes.insert(
            id,
            hits.iter().map(|(k, c)| (k.to_string(), *c)).collect(),
        );
        self
    }
}

impl Matcher for SceneMatcher {
    fn score(&self, frame: &GrayImage, fingerprint: &Fingerprint) -> Option<MatchScore> {
        let id = frame.get_pixel(0, 0)[0];
        let confidence = self
            .scenes
            .get(&id)
            .and_then(|hits| hits.get(&fingerprint.key))
            .copied()
            .unwrap_or(0.0);
        Some(MatchScore {
            confidence,
            bbox: HIT_BOX,
        })
    }
}

/// Deterministic pseudo-random texture; different seeds do not correlate.
pub fn noise(w: u32, h: u32, seed: u32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
        let mut v = x.wrapping_mul(0x9E37_79B1)
            ^ y.wrapping_mul(0x85EB_CA77)
            ^ seed.wrapping_mul(0xC2B2_AE3D);
        v ^= v >> 15;
        v = v.wrapping_mul(0x2C1B_3C6D);
        v ^= v >> 12;
        Luma([(v & 0xff) as u8])
    })
}

/// Paste `patch` into `frame` with its top-left corner at (x, y).
pub fn embed(frame: &mut GrayImage, patch: &GrayImage, x: u32, y: u32) {
    for (px, py, p) in patch.enumerate_pixels() {
        frame.put_pixel(x + px, y + py, *p);
    }
}

pub fn scene_frame(id: u8) -> Frame {
    GrayImage::from_pixel(8, 8, Luma([id]))
}

pub fn engine(matcher: SceneMatcher) -> PerceptionEngine {
    let registry = registry();
    let definitions = StateDefinitions::from_yaml_str(DEFINITIONS, "defs", &registry).unwrap();
    PerceptionEngine::with_matcher(registry, definitions, Box::new(matcher))
}

/// Plays back scene ids, one per capture. `None` is a failed capture. The last
/// entry repeats once the script runs out.
pub struct ScriptedFrames {
    script: Mutex<VecDeque<Option<u8>>>,
    last: Mutex<Option<u8>>,
    pub captures: AtomicU32,
}

impl ScriptedFrames {
    pub fn new(script: &[Option<u8>]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            last: Mutex::new(None),
            captures: AtomicU32::new(0),
        }
    }

    /// A screen that never changes.
    pub fn constant(id: u8) -> Self {
        Self::new(&[Some(id)])
    }

    pub fn captures(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for ScriptedFrames {
    async fn capture(&self) -> Result<Frame, DeviceError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        let current = match next {
            Some(step) => {
                *last = step;
                step
            }
            None => *last,
        };
        current
            .map(scene_frame)
            .ok_or_else(|| DeviceError::Capture("scripted failure".to_string()))
    }
}

/// Records every tap; foreground and liveness are fixed.
#[derive(Default)]
pub struct RecordingDevice {
    pub taps: Mutex<Vec<(u32, u32)>>,
    pub fail_taps: bool,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_taps: true,
            ..Self::default()
        }
    }

    pub fn taps(&self) -> Vec<(u32, u32)> {
        self.taps.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceExecutor for RecordingDevice {
    async fn tap(&self, x: u32, y: u32) -> Result<(), DeviceError> {
        if self.fail_taps {
            return Err(DeviceError::Capture("tap rejected".to_string()));
        }
        self.taps.lock().unwrap().push((x, y));
        Ok(())
    }

    async fn swipe(&self, x1: u32, y1: u32, _x2: u32, _y2: u32, _ms: u64) -> Result<(), DeviceError> {
        self.tap(x1, y1).await
    }

    async fn is_foregrounded(&self, _app_id: &str) -> Result<bool, DeviceError> {
        Ok(true)
    }

    async fn is_running(&self, _app_id: &str) -> Result<bool, DeviceError> {
        Ok(true)
    }

    async fn launch(&self, _app_id: &str) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn force_stop(&self, _app_id: &str) -> Result<(), DeviceError> {
        Ok(())
    }
}

pub struct Rig {
    pub input: ImmediateInput,
    pub frames: Arc<ScriptedFrames>,
    pub device: Arc<RecordingDevice>,
    pub metrics: Arc<Metrics>,
}

pub fn rig(matcher: SceneMatcher, frames: ScriptedFrames) -> Rig {
    rig_with_device(matcher, frames, RecordingDevice::new())
}

pub fn rig_with_device(matcher: SceneMatcher, frames: ScriptedFrames, device: RecordingDevice) -> Rig {
    let frames = Arc::new(frames);
    let device = Arc::new(device);
    let metrics = Arc::new(Metrics::new());
    let input = ImmediateInput::new(
        frames.clone(),
        device.clone(),
        Arc::new(engine(matcher)),
        metrics.clone(),
    );
    Rig {
        input,
        frames,
        device,
        metrics,
    }
}
