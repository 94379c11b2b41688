//! Greedy nearest-centroid tracking of moving regions across frames.

use types::{wrapping_elapsed_ms, CentroidHistory, Region, TrackId, TrackedRegion};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub max_match_distance: f64,
    pub max_lost_frames: u32,
    /// Centroid history depth; should cover `hover_time_ms` at the expected frame rate.
    pub history_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_match_distance: 40.0,
            max_lost_frames: 10,
            history_capacity: 64,
        }
    }
}

/// Owns the active track set. All timestamp arithmetic goes through
/// [`wrapping_elapsed_ms`] so a 32-bit millisecond counter rollover never
/// corrupts a track's reported age.
pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<TrackedRegion>,
    next_id: TrackId,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Associate `regions` with existing tracks, start new tracks for
    /// leftovers, retire tracks unmatched for too long, and return the
    /// current set of tracked regions.
    pub fn update(&mut self, regions: &[Region], timestamp_ms: u32) -> Vec<TrackedRegion> {
        let mut matched_region = vec![false; regions.len()];

        for track in &mut self.tracks {
            let mut best: Option<(usize, f64)> = None;
            let (tx, ty) = track.centroid;
            for (i, region) in regions.iter().enumerate() {
                if matched_region[i] {
                    continue;
                }
                let (rx, ry) = region.centroid();
                let dist = ((rx - tx).powi(2) + (ry - ty).powi(2)).sqrt();
                if dist <= self.config.max_match_distance {
                    match best {
                        Some((_, best_dist)) if best_dist <= dist => {}
                        _ => best = Some((i, dist)),
                    }
                }
            }

            if let Some((idx, _)) = best {
                matched_region[idx] = true;
                let region = regions[idx];
                track.region = region;
                track.centroid = region.centroid();
                track.last_seen_ms = timestamp_ms;
                track.frames_since_match = 0;
                track.history.push(timestamp_ms, track.centroid);
            } else {
                track.frames_since_match += 1;
            }
        }

        self.tracks
            .retain(|t| t.frames_since_match <= self.config.max_lost_frames);

        for (i, region) in regions.iter().enumerate() {
            if matched_region[i] {
                continue;
            }
            let centroid = region.centroid();
            let mut history = CentroidHistory::new(self.config.history_capacity);
            history.push(timestamp_ms, centroid);
            self.tracks.push(TrackedRegion {
                track_id: self.next_id,
                region: *region,
                created_ms: timestamp_ms,
                last_seen_ms: timestamp_ms,
                centroid,
                history,
                frames_since_match: 0,
            });
            self.next_id += 1;
        }

        self.tracks.clone()
    }

    pub fn track_age_ms(track: &TrackedRegion, now_ms: u32) -> u32 {
        wrapping_elapsed_ms(now_ms, track.created_ms)
    }
}
