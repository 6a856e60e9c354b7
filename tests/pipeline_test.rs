//! End-to-end solution of a two-exposure, two-device mosaic read from YAML.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use wcsfit::{
    align, initialize_defaulted, AlignConfig, AtomicMap, BootstrapConfig, BootstrapPoint, Bounds,
    CompositeMap, Detection, MapKind, MapShape, Match, PipelineConfig, PipelinePoint, PixelMap,
    PolyOrder, TransformRegistry,
};

const CONFIG: &str = "\
PixelMapCollection: 1
Maps:
  Identity:
    Type: Identity
  cam/ccd1:
    Type: Poly
    Order: 2
  cam/ccd2:
    Type: Poly
    Order: 2
  e1:
    Type: Linear
    Parameters: [0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
  e2:
    Type: Linear
    Parameters: [0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
  e1/ccd1:
    Type: Composite
    Elements: [cam/ccd1, e1]
  e1/ccd2:
    Type: Composite
    Elements: [cam/ccd2, e1]
  e2/ccd1:
    Type: Composite
    Elements: [cam/ccd1, e2]
  e2/ccd2:
    Type: Composite
    Elements: [cam/ccd2, e2]
";

const SIGMA: f64 = 1e-5;
const E2_TRUTH: [f64; 6] = [2e-3, 1.0, 0.0, -1e-3, 0.0, 1.0];

/// Truth for one device: 0.36 arcsec pixels with a small quadratic term.
fn device_truth(name: &str, x0: f64) -> anyhow::Result<AtomicMap> {
    // Terms per axis: 1, x, y, x², xy, y².
    Ok(AtomicMap::with_params(
        name,
        MapShape::Poly(PolyOrder::Total(2)),
        vec![x0, 1e-4, 0.0, 1e-10, 0.0, 0.0, 0.0, 0.0, 1e-4, 0.0, 0.0, -1e-10],
    )?)
}

#[test]
fn test_mosaic_solution() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let mut reg = TransformRegistry::from_reader(CONFIG.as_bytes())?;
    assert!(reg.is_defaulted("cam/ccd1")?);
    assert!(!reg.is_defaulted("e2")?);

    // Starting WCS per device: linear, no exposure offsets.
    let wcs1 = AtomicMap::with_params("wcs1", MapShape::Linear, vec![0.0, 1e-4, 0.0, 0.0, 0.0, 1e-4])?;
    let wcs2 = AtomicMap::with_params("wcs2", MapShape::Linear, vec![0.11, 1e-4, 0.0, 0.0, 0.0, 1e-4])?;
    let bounds = Bounds::new(0.0, 1000.0, 0.0, 1000.0);
    let layout = [
        ("e1/ccd1", "e1", &wcs1),
        ("e1/ccd2", "e1", &wcs2),
        ("e2/ccd1", "e2", &wcs1),
        ("e2/ccd2", "e2", &wcs2),
        ("Identity", "Identity", &wcs1),
    ];
    let points: Vec<PipelinePoint<'_>> = layout
        .iter()
        .map(|&(map_name, exposure, reference)| PipelinePoint {
            field: "field",
            exposure,
            point: BootstrapPoint {
                map_name,
                bounds,
                reference,
            },
        })
        .collect();

    let config = PipelineConfig {
        bootstrap: BootstrapConfig {
            grid_points: 128,
            ..Default::default()
        },
        ..Default::default()
    };
    let report = initialize_defaulted(&mut reg, &points, &config)?;
    assert_eq!(report.replaced, vec!["e1"]);
    assert_eq!(reg.kind("e1")?, MapKind::Identity);
    assert_eq!(report.outcomes.len(), 2);
    // Two order-2 polynomials and the Linear exposure map.
    assert_eq!(reg.n_free_params(), 12 + 12 + 6);

    // ── Synthetic matches against a noisy catalog ──
    let ccd1 = device_truth("cam/ccd1", 0.0)?;
    let ccd2 = device_truth("cam/ccd2", 0.11)?;
    let e2 = AtomicMap::with_params("e2", MapShape::Linear, E2_TRUTH.to_vec())?;
    let truths = [
        ("e1/ccd1", CompositeMap::new("t11", vec![ccd1.clone().into()])),
        ("e1/ccd2", CompositeMap::new("t12", vec![ccd2.clone().into()])),
        ("e2/ccd1", CompositeMap::new("t21", vec![ccd1.into(), e2.clone().into()])),
        ("e2/ccd2", CompositeMap::new("t22", vec![ccd2.into(), e2.into()])),
    ];

    let mut rng = StdRng::seed_from_u64(2024);
    let noise = Normal::new(0.0, SIGMA)?;
    let w = 2.0 / (SIGMA * SIGMA);
    let catalog = Arc::new(reg.issue("Identity")?);
    let mut matches = Vec::new();
    for (map_name, truth) in &truths {
        let view = Arc::new(reg.issue(map_name)?);
        for _ in 0..300 {
            let x = rng.random_range(0.0..1000.0);
            let y = rng.random_range(0.0..1000.0);
            let (xw, yw) = truth.to_world(x, y);
            let observed = (xw + noise.sample(&mut rng), yw + noise.sample(&mut rng));
            matches.push(Match::new(vec![
                Detection::new(observed, (w, w), catalog.clone()),
                Detection::new((x, y), (w, w), view.clone()),
            ]));
        }
    }

    let stats = align(&mut reg, &mut matches, &AlignConfig::default())?;
    println!("{}", stats.fit.summary());
    assert_eq!(stats.n_matches, 1200);
    assert!((stats.reduced_chisq() - 1.0).abs() < 0.2);

    let e2 = reg.params_of("e2")?;
    assert!((e2[0] - E2_TRUTH[0]).abs() < 2e-5, "{e2:?}");
    assert!((e2[3] - E2_TRUTH[3]).abs() < 2e-5, "{e2:?}");
    let ccd1 = reg.params_of("cam/ccd1")?;
    assert!((ccd1[1] - 1e-4).abs() < 5e-8, "{ccd1:?}");
    assert!((ccd1[8] - 1e-4).abs() < 5e-8, "{ccd1:?}");

    // The solution survives a round trip through YAML.
    let mut out = Vec::new();
    reg.write(&mut out)?;
    let back = TransformRegistry::from_reader(out.as_slice())?;
    assert!(!back.is_defaulted("cam/ccd2")?);
    let (a, b) = (back.params_of("e2")?, reg.params_of("e2")?);
    assert!((a - b).amax() < 1e-12);
    Ok(())
}
