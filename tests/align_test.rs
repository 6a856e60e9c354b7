//! Alignment of synthetic matches generated through a known Linear map.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use wcsfit::{
    align, AlignConfig, AtomicMap, Detection, FitStatus, MapShape, Match, PixelMap,
    TransformRegistry,
};

const TRUTH: [f64; 6] = [0.5, 0.01, 0.001, -0.3, -0.002, 0.01];

/// Noise per axis of the catalog positions, in world units.
const SIGMA: f64 = 1e-4;

/// Catalog detections carry all the noise; each side is weighted at half the
/// residual variance so that chisq/dof should come out near one.
fn synthetic_matches(
    reg: &TransformRegistry,
    n: usize,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<Match>> {
    let truth = AtomicMap::with_params("truth", MapShape::Linear, TRUTH.to_vec())?;
    let catalog = Arc::new(reg.issue("Identity")?);
    let device = Arc::new(reg.issue("cam/ccd")?);
    let noise = Normal::new(0.0, SIGMA)?;
    let w = 2.0 / (SIGMA * SIGMA);

    let mut matches = Vec::with_capacity(n);
    for _ in 0..n {
        let x = rng.random_range(0.0..1000.0);
        let y = rng.random_range(0.0..1000.0);
        let (xw, yw) = truth.to_world(x, y);
        let observed = (xw + noise.sample(rng), yw + noise.sample(rng));
        matches.push(Match::new(vec![
            Detection::new(observed, (w, w), catalog.clone()),
            Detection::new((x, y), (w, w), device.clone()),
        ]));
    }
    Ok(matches)
}

fn registry() -> anyhow::Result<TransformRegistry> {
    let mut reg = TransformRegistry::new();
    reg.learn_identity()?;
    reg.learn_atomic(
        "cam/ccd",
        MapShape::Linear,
        Some(&[0.4, 0.011, 0.0, -0.25, 0.0, 0.009]),
    )?;
    reg.rebuild_parameter_vector();
    Ok(reg)
}

#[test]
fn test_recover_noisy_linear() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mut reg = registry()?;
    let mut rng = StdRng::seed_from_u64(42);
    let mut matches = synthetic_matches(&reg, 500, &mut rng)?;

    let config = AlignConfig {
        clip_sigma: None,
        ..Default::default()
    };
    let stats = align(&mut reg, &mut matches, &config)?;
    println!("chisq {:.2} / {} dof", stats.chisq, stats.dof);
    assert_eq!(stats.status, FitStatus::Converged);
    assert_eq!(stats.n_matches, 500);
    assert_eq!(stats.dof, 2 * 500 - 6);
    assert!((stats.reduced_chisq() - 1.0).abs() < 0.2);

    // Standard errors: ~1.2e-5 for the offsets, ~1.6e-8 for the slopes.
    let p = reg.params_of("cam/ccd")?;
    for i in [0, 3] {
        assert!((p[i] - TRUTH[i]).abs() < 1e-4, "{p:?}");
    }
    for i in [1, 2, 4, 5] {
        assert!((p[i] - TRUTH[i]).abs() < 1e-7, "{p:?}");
    }
    Ok(())
}

#[test]
fn test_outlier_is_clipped() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mut reg = registry()?;
    let mut rng = StdRng::seed_from_u64(7);
    let mut matches = synthetic_matches(&reg, 500, &mut rng)?;
    // Move one catalog position by fifty sigma.
    matches[17].detections_mut()[0].pix.0 += 50.0 * SIGMA;

    let stats = align(&mut reg, &mut matches, &AlignConfig::default())?;
    assert_eq!(stats.clipped, 1);
    assert!(!matches[17].is_live());
    assert_eq!(stats.n_matches, 499);
    assert!((stats.reduced_chisq() - 1.0).abs() < 0.2);
    Ok(())
}

#[test]
fn test_reserved_matches_are_reported() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mut reg = registry()?;
    let mut rng = StdRng::seed_from_u64(99);
    let mut matches = synthetic_matches(&reg, 600, &mut rng)?;

    let config = AlignConfig {
        reserve_fraction: 0.2,
        ..Default::default()
    };
    let stats = align(&mut reg, &mut matches, &config)?;
    let reserved = matches.iter().filter(|m| m.reserved).count();
    assert!(reserved > 60 && reserved < 180);
    assert_eq!(stats.n_reserved, reserved);
    assert_eq!(stats.n_matches + stats.n_reserved, 600);

    // Held-out residuals follow the same noise as the fitted ones.
    assert_eq!(stats.reserved.count(), 2 * reserved);
    assert!((stats.reserved.reduced_chisq() - 1.0).abs() < 0.3);
    println!("{}\n{}", wcsfit::SUMMARY_HEADER, stats.reserved.summary());
    Ok(())
}
