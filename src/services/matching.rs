use crate::config::ConfigError;
use crate::models::{Fingerprint, Region};
use crate::services::registry::FingerprintRegistry;
use camino::Utf8Path;
use image::GrayImage;
use indexmap::IndexMap;

/// Variance below which a window is treated as flat and cannot correlate.
const FLAT_EPSILON: f64 = 1e-6;

/// Best match of one fingerprint inside a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    /// Normalized correlation in [-1, 1]
    pub confidence: f32,
    /// Where the template landed, in frame coordinates
    pub bbox: Region,
}

/// Scores a fingerprint against a frame.
///
/// The engine only ever asks for the best score; thresholding is done by the caller
/// so that `confidence >= threshold` is decided in one place.
pub trait Matcher: Send + Sync {
    fn score(&self, frame: &GrayImage, fingerprint: &Fingerprint) -> Option<MatchScore>;
}

/// Normalized cross-correlation matcher over preloaded grayscale templates.
pub struct TemplateMatcher {
    templates: IndexMap<String, GrayImage>,
}

impl TemplateMatcher {
    /// Decode every template the registry references, relative to `template_dir`.
    pub fn load(registry: &FingerprintRegistry, template_dir: &Utf8Path) -> Result<Self, ConfigError> {
        let mut templates = IndexMap::new();

        for entry in registry.iter() {
            let Some(template) = entry.template.as_ref() else {
                continue;
            };
            let path = template_dir.join(template);
            let image = image::open(&path).map_err(|e| ConfigError::Template {
                key: entry.key.clone(),
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let gray = image.to_luma8();
            if gray.width() == 0 || gray.height() == 0 {
                return Err(ConfigError::Template {
                    key: entry.key.clone(),
                    path,
                    reason: "template is empty".to_string(),
                });
            }
            templates.insert(entry.key.clone(), gray);
        }

        tracing::info!("Loaded {} templates from {}", templates.len(), template_dir);
        Ok(Self { templates })
    }

    pub fn from_templates(templates: IndexMap<String, GrayImage>) -> Self {
        Self { templates }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Matcher for TemplateMatcher {
    fn score(&self, frame: &GrayImage, fingerprint: &Fingerprint) -> Option<MatchScore> {
        let template = self.templates.get(&fingerprint.key)?;
        let search = match fingerprint.region {
            Some(region) => Some(region.expand_clamped(
                fingerprint.padding,
                frame.width(),
                frame.height(),
            )?),
            None => None,
        };
        match_template(frame, template, search)
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct Integral {
    width: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl Integral {
    fn build(frame: &GrayImage, area: Region) -> Self {
        let w = area.w as usize;
        let h = area.h as usize;
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = frame.get_pixel(area.x + x as u32, area.y + y as u32)[0] as f64;
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }

        Self {
            width: stride,
            sum,
            sum_sq,
        }
    }

    /// (sum, sum of squares) over the `w` x `h` window at (x, y).
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.width;
        let at = |t: &[f64], xx: usize, yy: usize| t[yy * s + xx];
        let sum = at(&self.sum, x + w, y + h) - at(&self.sum, x, y + h) - at(&self.sum, x + w, y)
            + at(&self.sum, x, y);
        let sq = at(&self.sum_sq, x + w, y + h) - at(&self.sum_sq, x, y + h)
            - at(&self.sum_sq, x + w, y)
            + at(&self.sum_sq, x, y);
        (sum, sq)
    }
}

/// Slide `template` over `search` (or the whole frame) and return the best
/// zero-mean normalized correlation.
///
/// Returns `None` when the template does not fit inside the search area.
pub fn match_template(frame: &GrayImage, template: &GrayImage, search: Option<Region>) -> Option<MatchScore> {
    let area = search.unwrap_or(Region::new(0, 0, frame.width(), frame.height()));
    let (tw, th) = (template.width(), template.height());
    if tw == 0 || th == 0 || tw > area.w || th > area.h {
        return None;
    }
    if area.x + area.w > frame.width() || area.y + area.h > frame.height() {
        return None;
    }

    let n = (tw * th) as f64;
    let t_mean = template.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let t_zero: Vec<f64> = template.pixels().map(|p| p[0] as f64 - t_mean).collect();
    let t_norm = t_zero.iter().map(|v| v * v).sum::<f64>();

    let integral = Integral::build(frame, area);
    let (tw, th) = (tw as usize, th as usize);
    let mut best: Option<(f64, usize, usize)> = None;

    for oy in 0..=(area.h as usize - th) {
        for ox in 0..=(area.w as usize - tw) {
            let (sum, sum_sq) = integral.window(ox, oy, tw, th);
            let w_var = sum_sq - sum * sum / n;

            let score = if t_norm < FLAT_EPSILON || w_var < FLAT_EPSILON {
                0.0
            } else {
                let mut cross = 0.0;
                for ty in 0..th {
                    let fy = area.y + (oy + ty) as u32;
                    let row = &t_zero[ty * tw..(ty + 1) * tw];
                    for (tx, tv) in row.iter().enumerate() {
                        let fx = area.x + (ox + tx) as u32;
                        cross += tv * frame.get_pixel(fx, fy)[0] as f64;
                    }
                }
                cross / (t_norm * w_var).sqrt()
            };

            if best.is_none_or(|(b, _, _)| score > b) {
                best = Some((score, ox, oy));
            }
        }
    }

    best.map(|(score, ox, oy)| MatchScore {
        confidence: score.clamp(-1.0, 1.0) as f32,
        bbox: Region::new(area.x + ox as u32, area.y + oy as u32, tw as u32, th as u32),
    })
}
