/// Keyframe detection by thumbnail differencing.
///
/// Each frame is reduced to a small grayscale thumbnail (the signature).
/// A frame is a keyframe when the fraction of thumbnail cells whose luma
/// moved by more than `pixel_delta` exceeds `change_threshold`. After a
/// detection, the next `cooldown_frames` frames are suppressed outright.

use image::imageops::{self, FilterType};
use tracing::debug;

use crate::config::DetectorConfig;
use crate::frame::Frame;

pub struct ChangeDetector {
    width: u32,
    height: u32,
    pixel_delta: u8,
    change_threshold: f32,
    cooldown_frames: u32,
    previous: Option<Vec<u8>>,
    cooldown_remaining: u32,
}

impl ChangeDetector {
    pub fn new(cfg: &DetectorConfig) -> Self {
        Self {
            width: cfg.signature_width.max(1),
            height: cfg.signature_height.max(1),
            pixel_delta: cfg.pixel_delta,
            change_threshold: cfg.change_threshold,
            cooldown_frames: cfg.cooldown_frames,
            previous: None,
            cooldown_remaining: 0,
        }
    }

    /// Feed one frame; returns true when it is a keyframe.
    pub fn observe(&mut self, frame: &Frame) -> bool {
        let signature = self.signature(frame);
        let distance = self
            .previous
            .as_deref()
            .map(|previous| changed_fraction(previous, &signature, self.pixel_delta));
        // The signature always advances, also during cooldown.
        self.previous = Some(signature);

        let Some(distance) = distance else {
            return false;
        };

        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            return false;
        }

        if distance > self.change_threshold {
            debug!(
                "Change detected: {:.3} of cells moved (threshold {:.3})",
                distance, self.change_threshold
            );
            self.cooldown_remaining = self.cooldown_frames;
            return true;
        }
        false
    }

    fn signature(&self, frame: &Frame) -> Vec<u8> {
        let gray = imageops::grayscale(&frame.image);
        imageops::resize(&gray, self.width, self.height, FilterType::Triangle).into_raw()
    }
}

/// Fraction of cells whose absolute difference exceeds `delta`.
fn changed_fraction(a: &[u8], b: &[u8], delta: u8) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let changed = a
        .iter()
        .zip(b)
        .filter(|(x, y)| x.abs_diff(**y) > delta)
        .count();
    changed as f32 / a.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(shade: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(32, 18, Rgb([shade, shade, shade])))
    }

    fn detector(cooldown: u32) -> ChangeDetector {
        ChangeDetector::new(&DetectorConfig {
            signature_width: 8,
            signature_height: 4,
            pixel_delta: 25,
            change_threshold: 0.01,
            cooldown_frames: cooldown,
        })
    }

    #[test]
    fn first_frame_never_fires() {
        let mut det = detector(5);
        assert!(!det.observe(&solid(255)));
    }

    #[test]
    fn static_scene_stays_quiet() {
        let mut det = detector(5);
        for _ in 0..20 {
            assert!(!det.observe(&solid(100)));
        }
    }

    #[test]
    fn large_change_fires_then_cools_down() {
        let mut det = detector(3);
        assert!(!det.observe(&solid(0)));
        assert!(det.observe(&solid(255)));
        // Suppressed even though every frame flips.
        assert!(!det.observe(&solid(0)));
        assert!(!det.observe(&solid(255)));
        assert!(!det.observe(&solid(0)));
        assert!(det.observe(&solid(255)));
    }

    #[test]
    fn detections_respect_cooldown_gap() {
        let cooldown = 4;
        let mut det = detector(cooldown);
        let mut hits = Vec::new();
        for i in 0..200u32 {
            // Alternating plus pseudo-random shading.
            let shade = if i % 2 == 0 { 0 } else { ((i * 97) % 256) as u8 | 0x80 };
            if det.observe(&solid(shade)) {
                hits.push(i);
            }
        }
        assert!(hits.len() > 1);
        for pair in hits.windows(2) {
            assert!(pair[1] - pair[0] >= cooldown);
        }
    }

    #[test]
    fn small_change_below_delta_is_ignored() {
        let mut det = detector(0);
        det.observe(&solid(100));
        assert!(!det.observe(&solid(110)));
    }
}
