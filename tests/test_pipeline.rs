// tests/test_pipeline.rs — end-to-end scenarios on the reference pipeline.
//
// These exercise the orchestration semantics shared with the GPU pipeline:
// guards, capacity clamping, the mutual cross-check, and the behaviour on
// self-match / translated / degenerate inputs. The GPU mirror runs the
// same scenarios in its #[ignore]d in-crate suite.

use descry::image::{ColorImage, Image};
use descry::pipeline::{PipelineConfig, PipelineError, ReferencePipeline};

/// Noise scene: essentially every descriptor is unique, so self-matching
/// is the identity mapping.
fn noise_scene(w: usize, h: usize, seed: u32) -> ColorImage {
    let mut rng = seed;
    let gray = Image::from_vec(
        w,
        h,
        (0..w * h)
            .map(|_| {
                rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
                (rng >> 24) as u8
            })
            .collect(),
    );
    ColorImage::from_gray(&gray)
}

/// Bright rectangles on a dark background, optionally shifted — rectangle
/// corners are reliable FAST corners and survive translation exactly.
fn shifted_scene(w: usize, h: usize, dx: usize, dy: usize) -> ColorImage {
    let mut gray = Image::from_vec(w, h, vec![25u8; w * h]);
    for &(rx, ry, rw, rh, val) in &[
        (30usize, 25usize, 20usize, 20usize, 200u8),
        (70, 20, 25, 15, 180),
        (25, 65, 22, 25, 190),
        (75, 60, 30, 20, 170),
    ] {
        for y in (ry + dy)..((ry + dy + rh).min(h)) {
            for x in (rx + dx)..((rx + dx + rw).min(w)) {
                gray.set(x, y, val);
            }
        }
    }
    ColorImage::from_gray(&gray)
}

fn small_config() -> PipelineConfig {
    PipelineConfig { max_keypoints: 128, ..Default::default() }
}

// ===== Guards =====

#[test]
fn processing_before_set_image_size_is_an_error() {
    let mut p = ReferencePipeline::new(small_config());
    let img = shifted_scene(160, 120, 0, 0);
    assert!(matches!(
        p.identify_feature_points(&img),
        Err(PipelineError::NotConfigured)
    ));
}

#[test]
fn dimension_mismatch_fast_fails_to_empty() {
    let mut p = ReferencePipeline::new(small_config());
    p.set_image_size(640, 480);
    let a = noise_scene(640, 480, 1);
    let b = noise_scene(320, 240, 2);
    let pairs = p.identify_feature_points_between_images(&a, &b).unwrap();
    assert!(pairs.is_empty());
    assert!(pairs.keypoints_a.is_empty() && pairs.keypoints_b.is_empty());
}

// ===== Degenerate inputs =====

#[test]
fn featureless_images_yield_zero_keypoints_and_pairs() {
    let mut p = ReferencePipeline::new(small_config());
    p.set_image_size(96, 96);
    let blank = ColorImage::from_gray(&Image::from_vec(96, 96, vec![127u8; 96 * 96]));

    let (kps, stats) = p.identify_feature_points(&blank).unwrap();
    assert!(kps.is_empty());
    assert_eq!(stats.detected, 0);
    assert_eq!(stats.dropped, 0);

    let pairs = p.identify_feature_points_between_images(&blank, &blank).unwrap();
    assert_eq!(pairs.len(), 0);
}

// ===== Capacity =====

#[test]
fn overflow_is_clamped_and_reported() {
    let mut p = ReferencePipeline::new(PipelineConfig { max_keypoints: 5, ..Default::default() });
    p.set_image_size(160, 120);
    let img = noise_scene(160, 120, 3);
    let (kps, stats) = p.identify_feature_points(&img).unwrap();
    assert_eq!(kps.len(), 5);
    assert!(stats.detected > 5);
    assert_eq!(stats.dropped, stats.detected - 5);
}

// ===== Matching scenarios =====

#[test]
fn self_match_accepts_identity_pairs() {
    let mut p = ReferencePipeline::new(PipelineConfig {
        max_keypoints: 128,
        match_threshold: 1,
        ..Default::default()
    });
    p.set_image_size(160, 120);
    let img = noise_scene(160, 120, 4);
    let pairs = p.identify_feature_points_between_images(&img, &img).unwrap();

    assert!(!pairs.is_empty());
    for (c, (ka, kb)) in pairs
        .correspondences
        .iter()
        .zip(pairs.keypoints_a.iter().zip(&pairs.keypoints_b))
    {
        assert_eq!(c.source, c.target);
        assert_eq!((ka.x, ka.y), (kb.x, kb.y));
    }
}

#[test]
fn translation_deltas_cluster_around_the_shift() {
    let (dx, dy) = (4i32, 2i32);
    let mut p = ReferencePipeline::new(PipelineConfig {
        max_keypoints: 128,
        match_threshold: 60,
        ..Default::default()
    });
    p.set_image_size(160, 120);
    let a = shifted_scene(160, 120, 0, 0);
    let b = shifted_scene(160, 120, dx as usize, dy as usize);
    let pairs = p.identify_feature_points_between_images(&a, &b).unwrap();
    assert!(!pairs.is_empty());

    let mut consistent = 0usize;
    for (ka, kb) in pairs.keypoints_a.iter().zip(&pairs.keypoints_b) {
        let ddx = kb.x - ka.x;
        let ddy = kb.y - ka.y;
        if (ddx - dx as f32).abs() <= 1.5 && (ddy - dy as f32).abs() <= 1.5 {
            consistent += 1;
        }
    }
    assert!(
        consistent * 2 > pairs.len(),
        "only {consistent}/{} correspondences near ({dx}, {dy})",
        pairs.len()
    );
}

#[test]
fn pair_results_are_deterministic() {
    let a = shifted_scene(160, 120, 0, 0);
    let b = shifted_scene(160, 120, 3, 1);

    let run = || {
        let mut p = ReferencePipeline::new(PipelineConfig {
            max_keypoints: 128,
            match_threshold: 60,
            ..Default::default()
        });
        p.set_image_size(160, 120);
        p.identify_feature_points_between_images(&a, &b).unwrap()
    };
    let p1 = run();
    let p2 = run();
    assert_eq!(p1.correspondences, p2.correspondences);
}

#[test]
fn correspondences_are_emitted_in_ascending_source_order() {
    let mut p = ReferencePipeline::new(PipelineConfig {
        max_keypoints: 128,
        match_threshold: 60,
        ..Default::default()
    });
    p.set_image_size(160, 120);
    let a = shifted_scene(160, 120, 0, 0);
    let b = shifted_scene(160, 120, 2, 2);
    let pairs = p.identify_feature_points_between_images(&a, &b).unwrap();
    for w in pairs.correspondences.windows(2) {
        assert!(w[0].source < w[1].source);
    }
}
