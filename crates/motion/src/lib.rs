//! Per-frame background subtraction and connected-component region extraction.

use tracing::{debug, warn};
use types::{Frame, Region};

/// Regions above this count are dropped, larger regions preferred.
pub const MAX_REGIONS: usize = 32;

/// Hard bound on the explicit flood-fill stack; no recursion is used so a
/// pathological frame can never blow a call stack.
const FLOOD_FILL_STACK_BOUND: usize = 16_384;

/// Emit the stack-overflow warning once every this many occurrences.
const TRUNCATION_WARN_EVERY: u64 = 100;

#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Background update rate α in `new = (1-α)·old + α·current`.
    pub learning_rate: f64,
    /// `|current - background| > threshold` marks a pixel foreground.
    pub threshold: u8,
    pub min_size: u32,
    pub max_size: u32,
    pub min_area: u32,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Accepted and logged, never implemented.
    pub detect_shadows: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            threshold: 25,
            min_size: 8,
            max_size: 80,
            min_area: 16,
            min_aspect_ratio: 0.3,
            max_aspect_ratio: 3.0,
            detect_shadows: false,
        }
    }
}

/// Maintains the running background model and extracts foreground regions.
pub struct Motion {
    config: MotionConfig,
    width: u32,
    height: u32,
    background: Vec<f64>,
    truncation_count: u64,
}

impl Motion {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            width: 0,
            height: 0,
            background: Vec::new(),
            truncation_count: 0,
        }
    }

    /// Run background subtraction, morphological opening, and connected
    /// component extraction on one frame. The first frame (or any frame whose
    /// dimensions differ from the current model) resets the background and
    /// returns no regions.
    pub fn detect(&mut self, frame: &Frame<'_>) -> Vec<Region> {
        let w = frame.meta.width;
        let h = frame.meta.height;
        if w != self.width || h != self.height {
            self.reset_background(frame);
            return Vec::new();
        }

        if self.config.detect_shadows {
            debug!("detect_shadows is set but shadow detection is not implemented");
        }

        let mut mask = vec![false; (w * h) as usize];
        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) as usize;
                let current = frame.pixel(x, y) as f64;
                let bg = self.background[idx];
                mask[idx] = (current - bg).abs() > self.config.threshold as f64;
                self.background[idx] =
                    (1.0 - self.config.learning_rate) * bg + self.config.learning_rate * current;
            }
        }

        let eroded = erode3x3(&mask, w, h);
        let opened = dilate3x3(&eroded, w, h);
        let candidates = self.extract_regions(&opened, w, h);
        filter_and_cap(candidates, &self.config)
    }

    fn reset_background(&mut self, frame: &Frame<'_>) {
        self.width = frame.meta.width;
        self.height = frame.meta.height;
        self.background = frame.luma().iter().map(|&p| p as f64).collect();
    }

    /// 4-connectivity flood fill over the cleaned mask using an explicit,
    /// bounded stack. A region whose fill exceeds the bound is truncated in
    /// place rather than recursing further, with a rate-limited warning.
    fn extract_regions(&mut self, mask: &[bool], w: u32, h: u32) -> Vec<Region> {
        let mut visited = vec![false; mask.len()];
        let mut regions = Vec::new();

        for start_y in 0..h {
            for start_x in 0..w {
                let start_idx = (start_y * w + start_x) as usize;
                if visited[start_idx] || !mask[start_idx] {
                    continue;
                }

                let mut stack = Vec::with_capacity(64);
                stack.push((start_x, start_y));
                visited[start_idx] = true;

                let (mut min_x, mut min_y) = (start_x, start_y);
                let (mut max_x, mut max_y) = (start_x, start_y);
                let mut area: u32 = 0;
                let mut truncated = false;

                while let Some((x, y)) = stack.pop() {
                    area += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);

                    for (nx, ny) in neighbors4(x, y, w, h) {
                        let nidx = (ny * w + nx) as usize;
                        if !visited[nidx] && mask[nidx] {
                            if stack.len() >= FLOOD_FILL_STACK_BOUND {
                                truncated = true;
                                continue;
                            }
                            visited[nidx] = true;
                            stack.push((nx, ny));
                        }
                    }
                }

                if truncated {
                    self.truncation_count += 1;
                    if self.truncation_count % TRUNCATION_WARN_EVERY == 1 {
                        warn!(
                            count = self.truncation_count,
                            "flood fill hit stack bound; region truncated"
                        );
                    }
                }

                regions.push(Region {
                    x: min_x,
                    y: min_y,
                    w: max_x - min_x + 1,
                    h: max_y - min_y + 1,
                });
            }
        }

        regions
    }
}

fn neighbors4(x: u32, y: u32, w: u32, h: u32) -> impl Iterator<Item = (u32, u32)> {
    let mut out = Vec::with_capacity(4);
    if x > 0 {
        out.push((x - 1, y));
    }
    if x + 1 < w {
        out.push((x + 1, y));
    }
    if y > 0 {
        out.push((x, y - 1));
    }
    if y + 1 < h {
        out.push((x, y + 1));
    }
    out.into_iter()
}

fn erode3x3(mask: &[bool], w: u32, h: u32) -> Vec<bool> {
    apply3x3(mask, w, h, |set, any_false| set && !any_false)
}

fn dilate3x3(mask: &[bool], w: u32, h: u32) -> Vec<bool> {
    apply3x3(mask, w, h, |_set, any_false| !any_false)
}

/// Shared 3x3-neighborhood pass. `combine(center, any_neighbor_false)`
/// decides the output: erosion requires a full neighborhood, dilation
/// requires just one hit. Out-of-bounds neighbors count as background.
fn apply3x3(mask: &[bool], w: u32, h: u32, combine: impl Fn(bool, bool) -> bool) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let center = mask[(y as u32 * w + x as u32) as usize];
            let mut any_false = false;
            let mut any_true = false;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let nx = x + dx;
                    let ny = y + dy;
                    let v = if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        false
                    } else {
                        mask[(ny as u32 * w + nx as u32) as usize]
                    };
                    if v {
                        any_true = true;
                    } else {
                        any_false = true;
                    }
                }
            }
            out[(y as u32 * w + x as u32) as usize] = if center || any_true {
                combine(center, any_false)
            } else {
                false
            };
        }
    }
    out
}

/// Apply area/size/aspect-ratio filters, then cap to [`MAX_REGIONS`],
/// preferring larger regions when the candidate set must be truncated.
fn filter_and_cap(mut candidates: Vec<Region>, config: &MotionConfig) -> Vec<Region> {
    candidates.retain(|r| {
        r.area() >= config.min_area
            && r.min_side() >= config.min_size
            && r.max_side() <= config.max_size
            && r.aspect_ratio() >= config.min_aspect_ratio
            && r.aspect_ratio() <= config.max_aspect_ratio
    });
    if candidates.len() > MAX_REGIONS {
        candidates.sort_by(|a, b| b.area().cmp(&a.area()));
        candidates.truncate(MAX_REGIONS);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(w: u32, h: u32, value: u8) -> Vec<u8> {
        vec![value; (w * h) as usize]
    }

    #[test]
    fn first_frame_seeds_background_and_yields_no_regions() {
        let mut motion = Motion::new(MotionConfig::default());
        let buf = solid_frame(16, 16, 10);
        let frame = Frame::new(16, 16, 0, &buf);
        assert!(motion.detect(&frame).is_empty());
    }

    #[test]
    fn resized_frame_resets_background() {
        let mut motion = Motion::new(MotionConfig::default());
        let buf1 = solid_frame(16, 16, 10);
        motion.detect(&Frame::new(16, 16, 0, &buf1));
        let buf2 = solid_frame(32, 32, 10);
        assert!(motion.detect(&Frame::new(32, 32, 33, &buf2)).is_empty());
    }

    #[test]
    fn bright_square_on_dark_background_is_detected() {
        let config = MotionConfig {
            min_size: 2,
            max_size: 40,
            min_area: 4,
            min_aspect_ratio: 0.1,
            max_aspect_ratio: 10.0,
            ..MotionConfig::default()
        };
        let mut motion = Motion::new(config);
        let w = 32;
        let h = 32;
        let bg = solid_frame(w, h, 10);
        motion.detect(&Frame::new(w, h, 0, &bg));

        let mut fg = bg.clone();
        for y in 10..18 {
            for x in 10..18 {
                fg[(y * w + x) as usize] = 200;
            }
        }
        let regions = motion.detect(&Frame::new(w, h, 33, &fg));
        assert_eq!(regions.len(), 1);
        let r = regions[0];
        assert!(r.x <= 10 && r.y <= 10);
        assert!(r.x + r.w >= 18 && r.y + r.h >= 18);
    }

    #[test]
    fn filter_and_cap_prefers_larger_regions_on_overflow() {
        let config = MotionConfig {
            min_size: 1,
            max_size: 1000,
            min_area: 1,
            min_aspect_ratio: 0.01,
            max_aspect_ratio: 100.0,
            ..MotionConfig::default()
        };
        let mut candidates = Vec::new();
        for i in 0..60u32 {
            candidates.push(Region {
                x: i,
                y: 0,
                w: 1 + (i % 5),
                h: 1 + (i % 5),
            });
        }
        let kept = filter_and_cap(candidates, &config);
        assert_eq!(kept.len(), MAX_REGIONS);
    }

    #[test]
    fn filter_rejects_out_of_range_regions() {
        let config = MotionConfig::default();
        let candidates = vec![
            Region { x: 0, y: 0, w: 1, h: 1 },  // too small
            Region { x: 0, y: 0, w: 200, h: 200 }, // too large
        ];
        let kept = filter_and_cap(candidates, &config);
        assert!(kept.is_empty());
    }

    #[test]
    fn erosion_removes_single_pixel_noise() {
        let w = 5;
        let h = 5;
        let mut mask = vec![false; 25];
        mask[12] = true; // isolated center pixel
        let eroded = erode3x3(&mask, w, h);
        assert!(eroded.iter().all(|&v| !v));
    }

    #[test]
    fn dilation_grows_region() {
        let w = 5;
        let h = 5;
        let mut mask = vec![false; 25];
        mask[12] = true;
        let dilated = dilate3x3(&mask, w, h);
        assert!(dilated.iter().filter(|&&v| v).count() > 1);
    }
}
