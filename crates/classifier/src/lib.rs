//! Size-then-hover classification of tracked regions into confidence tiers.

use types::{
    wrapping_elapsed_ms, ClassifiedDetection, Confidence, SizeTag, TrackedRegion,
};

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub min_size_px: u32,
    pub hornet_min_size_px: u32,
    pub hornet_max_size_px: u32,
    pub hover_time_ms: u32,
    pub hover_radius_px: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_size_px: 8,
            hornet_min_size_px: 20,
            hornet_max_size_px: 80,
            hover_time_ms: 1500,
            hover_radius_px: 12.0,
        }
    }
}

pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, tracked: &[TrackedRegion], now_ms: u32) -> Vec<ClassifiedDetection> {
        tracked
            .iter()
            .map(|track| self.classify_one(track, now_ms))
            .collect()
    }

    fn size_tag(&self, size: u32) -> SizeTag {
        if size < self.config.min_size_px {
            SizeTag::TooSmall
        } else if size < self.config.hornet_min_size_px {
            SizeTag::Unknown
        } else if size <= self.config.hornet_max_size_px {
            SizeTag::Hornet
        } else {
            SizeTag::TooLarge
        }
    }

    fn classify_one(&self, track: &TrackedRegion, now_ms: u32) -> ClassifiedDetection {
        let size_tag = self.size_tag(track.region.max_side());
        let hover_duration_ms = track.history.window_duration_ms();
        let is_hovering = track.history.max_pairwise_distance() <= self.config.hover_radius_px
            && hover_duration_ms >= self.config.hover_time_ms;

        let confidence = match (size_tag, is_hovering) {
            (SizeTag::Hornet, true) => Confidence::High,
            (SizeTag::Hornet, false) => Confidence::Medium,
            _ => Confidence::Low,
        };

        ClassifiedDetection {
            track_id: track.track_id,
            region: track.region,
            size_tag,
            confidence,
            is_hovering,
            hover_duration_ms,
            track_age_ms: wrapping_elapsed_ms(now_ms, track.created_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::CentroidHistory;

    fn track_with(region_side: u32, history: CentroidHistory) -> TrackedRegion {
        TrackedRegion {
            track_id: 1,
            region: types::Region {
                x: 0,
                y: 0,
                w: region_side,
                h: region_side,
            },
            created_ms: 0,
            last_seen_ms: 0,
            centroid: (0.0, 0.0),
            history,
            frames_since_match: 0,
        }
    }

    #[test]
    fn too_small_region_is_low_confidence() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let mut history = CentroidHistory::new(8);
        history.push(0, (0.0, 0.0));
        let track = track_with(4, history);
        let result = classifier.classify(&[track], 0);
        assert_eq!(result[0].confidence, Confidence::Low);
        assert_eq!(result[0].size_tag, SizeTag::TooSmall);
    }

    #[test]
    fn hornet_sized_present_one_frame_is_medium() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let mut history = CentroidHistory::new(8);
        history.push(0, (0.0, 0.0));
        let track = track_with(40, history);
        let result = classifier.classify(&[track], 0);
        assert_eq!(result[0].size_tag, SizeTag::Hornet);
        assert_eq!(result[0].confidence, Confidence::Medium);
        assert!(!result[0].is_hovering);
    }

    #[test]
    fn hornet_sized_hovering_long_enough_is_high() {
        let config = ClassifierConfig::default();
        let classifier = Classifier::new(config.clone());
        let mut history = CentroidHistory::new(32);
        for t in (0..=config.hover_time_ms + 100).step_by(100) {
            history.push(t, (5.0, 5.0));
        }
        let track = track_with(40, history);
        let result = classifier.classify(&[track], config.hover_time_ms + 100);
        assert_eq!(result[0].confidence, Confidence::High);
        assert!(result[0].is_hovering);
    }

    #[test]
    fn hornet_sized_moving_too_much_is_not_hovering() {
        let config = ClassifierConfig::default();
        let classifier = Classifier::new(config.clone());
        let mut history = CentroidHistory::new(32);
        for (i, t) in (0..=config.hover_time_ms + 100).step_by(100).enumerate() {
            history.push(t, (i as f64 * 50.0, 0.0));
        }
        let track = track_with(40, history);
        let result = classifier.classify(&[track], config.hover_time_ms + 100);
        assert_eq!(result[0].confidence, Confidence::Medium);
        assert!(!result[0].is_hovering);
    }

    #[test]
    fn too_large_region_is_low_confidence() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let mut history = CentroidHistory::new(8);
        history.push(0, (0.0, 0.0));
        let track = track_with(200, history);
        let result = classifier.classify(&[track], 0);
        assert_eq!(result[0].size_tag, SizeTag::TooLarge);
        assert_eq!(result[0].confidence, Confidence::Low);
    }
}
