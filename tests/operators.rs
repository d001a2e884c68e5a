use approx::assert_abs_diff_eq;
use ndarray::Array2;
use sartile::cluster::kmeans::{KMeansAccumulator, KMeansClusterOp, KMeansParams};
use sartile::cluster::{ClusterSelection, CLASS_INDICES, NO_CLASS};
use sartile::core::calibrate::CalibrationOp;
use sartile::core::coherence::{CoherenceOp, CoherenceParams};
use sartile::core::interferogram::InterferogramOp;
use sartile::core::phase_filter::{GoldsteinFilterOp, GoldsteinParams};
use sartile::engine::buffer::DataType;
use sartile::engine::product::{Band, Product, Unit};
use sartile::{Operator, OperatorState, ParameterMap, Rectangle, TileExecutor};
use std::io::Write;
use std::sync::Arc;
use std::thread;

fn complex_pair(product: &mut Product, name: &str, re: Array2<f64>, im: Array2<f64>) {
    product
        .add_band(Band::with_data(&format!("i_{}", name), Unit::Real, DataType::Float64, re))
        .unwrap();
    product
        .add_band(Band::with_data(&format!("q_{}", name), Unit::Imaginary, DataType::Float64, im))
        .unwrap();
}

/// Master/slave stack with a smooth phase ramp and some speckle-like texture
fn insar_stack(width: usize, height: usize) -> Arc<Product> {
    let mut product = Product::new("stack", width, height);
    let phase = |r: usize, c: usize| 0.35 * c as f64 - 0.2 * r as f64;
    let amp = |r: usize, c: usize| 1.0 + ((r * 5 + c * 11) % 7) as f64 * 0.3;
    complex_pair(
        &mut product,
        "VV_mst",
        Array2::from_shape_fn((height, width), |(r, c)| amp(r, c) * phase(r, c).cos()),
        Array2::from_shape_fn((height, width), |(r, c)| amp(r, c) * phase(r, c).sin()),
    );
    complex_pair(
        &mut product,
        "VV_slv1",
        Array2::from_shape_fn((height, width), |(r, c)| amp(c, r) * (phase(r, c) + 0.1 * r as f64).cos()),
        Array2::from_shape_fn((height, width), |(r, c)| amp(c, r) * (phase(r, c) + 0.1 * r as f64).sin()),
    );
    Arc::new(product)
}

fn assert_tiles_match(op: &dyn Operator, band: &str, width: usize, height: usize, tw: usize, th: usize) {
    let whole = op.compute_tile(band, &Rectangle::of_size(width, height)).unwrap();
    for rect in Rectangle::tiles(width, height, tw, th).unwrap() {
        let part = op.compute_tile(band, &rect).unwrap();
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                assert_abs_diff_eq!(part.get(x, y), whole.get(x, y), epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_coherence_independent_of_tiling() {
    let mut op = CoherenceOp::with_params(CoherenceParams {
        win_range: 4,
        win_azimuth: 3,
    });
    op.initialize(insar_stack(17, 13)).unwrap();
    assert_tiles_match(&op, "coh_VV_slv1", 17, 13, 5, 4);
    assert_tiles_match(&op, "coh_VV_slv1", 17, 13, 1, 13);
}

#[test]
fn test_coherence_of_image_with_itself_is_one() {
    let source = insar_stack(9, 7);
    let mut product = Product::new("self", 9, 7);
    for band in source.bands().iter().filter(|b| b.name().ends_with("mst")) {
        let data = (**band.raster().unwrap()).clone();
        product
            .add_band(Band::with_data(band.name(), band.unit(), DataType::Float64, data.clone()))
            .unwrap();
        let slave = band.name().replace("mst", "slv1");
        product
            .add_band(Band::with_data(&slave, band.unit(), DataType::Float64, data))
            .unwrap();
    }

    let mut op = CoherenceOp::with_params(CoherenceParams {
        win_range: 3,
        win_azimuth: 3,
    });
    op.initialize(Arc::new(product)).unwrap();
    let tile = op.compute_tile("coh_VV_slv1", &Rectangle::of_size(9, 7)).unwrap();
    for v in tile.to_array().iter() {
        assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-6);
    }
}

#[test]
fn test_coherence_within_unit_interval() {
    let mut op = CoherenceOp::with_params(CoherenceParams {
        win_range: 5,
        win_azimuth: 5,
    });
    op.initialize(insar_stack(15, 12)).unwrap();
    let tile = op.compute_tile("coh_VV_slv1", &Rectangle::new(3, 2, 10, 8)).unwrap();
    assert!(tile.to_array().iter().all(|v| (0.0..=1.0 + 1e-12).contains(v)));
}

#[test]
fn test_interferogram_multiplies_by_slave_conjugate() {
    let mut product = Product::new("unit", 4, 3);
    complex_pair(&mut product, "VV_mst", Array2::from_elem((3, 4), 1.0), Array2::zeros((3, 4)));
    complex_pair(&mut product, "VV_slv1", Array2::zeros((3, 4)), Array2::from_elem((3, 4), 1.0));

    let mut op = InterferogramOp::new();
    op.initialize(Arc::new(product)).unwrap();
    let tiles = op.compute_tile_stack(&Rectangle::of_size(4, 3)).unwrap();
    assert_abs_diff_eq!(tiles["i_ifg_VV_slv1"].get(1, 1), 0.0);
    assert_abs_diff_eq!(tiles["q_ifg_VV_slv1"].get(1, 1), -1.0);
}

fn phase_field(size: usize, phase: impl Fn(usize, usize) -> f64) -> (Array2<f64>, Array2<f64>) {
    let amp = |r: usize, c: usize| 1.0 + ((r + 2 * c) % 3) as f64 * 0.5;
    (
        Array2::from_shape_fn((size, size), |(r, c)| amp(r, c) * phase(r, c).cos()),
        Array2::from_shape_fn((size, size), |(r, c)| amp(r, c) * phase(r, c).sin()),
    )
}

/// Dual-pol stack whose VH slave repeats the VH master exactly
fn dual_pol_stack(size: usize) -> Arc<Product> {
    let mut product = Product::new("dual-pol", size, size);
    let vv = |r: usize, c: usize| 0.4 * c as f64 + 0.25 * r as f64;
    let vh = |r: usize, c: usize| ((r * 7 + c * 3) % 5) as f64 - 0.6 * r as f64;
    for (name, (re, im)) in [
        ("VV_mst", phase_field(size, vv)),
        ("VH_mst", phase_field(size, vh)),
        ("VV_slv1", phase_field(size, |r, c| vv(r, c) + 0.3 * c as f64)),
        ("VH_slv1", phase_field(size, vh)),
    ] {
        complex_pair(&mut product, name, re, im);
    }
    Arc::new(product)
}

#[test]
fn test_dual_pol_slaves_pair_with_master_of_same_polarisation() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut coherence = CoherenceOp::with_params(CoherenceParams {
        win_range: 3,
        win_azimuth: 3,
    });
    let target = coherence.initialize(dual_pol_stack(8)).unwrap();
    assert_eq!(target.band_names(), vec!["coh_VV_slv1", "coh_VH_slv1"]);
    let coh = coherence.compute_tile("coh_VH_slv1", &Rectangle::new(2, 2, 4, 4)).unwrap();
    assert_abs_diff_eq!(coh.get(4, 4), 1.0, epsilon = 1e-6);
    for v in coh.to_array().iter() {
        assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-6);
    }

    let mut ifg = InterferogramOp::new();
    ifg.initialize(dual_pol_stack(8)).unwrap();
    let tiles = ifg.compute_tile_stack(&Rectangle::of_size(8, 8)).unwrap();
    let q = &tiles["q_ifg_VH_slv1"];
    assert_abs_diff_eq!(q.get(3, 2), 0.0, epsilon = 1e-6);
    for v in q.to_array().iter() {
        assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-6);
    }
    // VV still carries its own phase ramp against the VV master
    let expected = -0.3 * 3.0;
    let phase = tiles["q_ifg_VV_slv1"].get(3, 2).atan2(tiles["i_ifg_VV_slv1"].get(3, 2));
    assert_abs_diff_eq!(phase, expected, epsilon = 1e-5);
}

#[test]
fn test_goldstein_executor_matches_single_tile() {
    let mut ifg = Product::new("ifg", 40, 27);
    let phase = |r: usize, c: usize| 0.3 * c as f64 + 0.2 * r as f64 + ((r * 3 + c) % 4) as f64 * 0.4;
    ifg.add_band(Band::with_data(
        "i_ifg",
        Unit::Real,
        DataType::Float64,
        Array2::from_shape_fn((27, 40), |(r, c)| phase(r, c).cos()),
    ))
    .unwrap();
    ifg.add_band(Band::with_data(
        "q_ifg",
        Unit::Imaginary,
        DataType::Float64,
        Array2::from_shape_fn((27, 40), |(r, c)| phase(r, c).sin()),
    ))
    .unwrap();

    let mut op = GoldsteinFilterOp::with_params(GoldsteinParams {
        alpha: 0.6,
        block_size: 16,
        overlap: 3,
        ..Default::default()
    });
    op.initialize(Arc::new(ifg)).unwrap();

    let product = TileExecutor::with_tile_size(9, 6).execute(&op).unwrap();
    let whole = op.compute_tile("i_ifg", &Rectangle::of_size(40, 27)).unwrap();
    let raster = product.band("i_ifg").unwrap().raster().unwrap().clone();
    for y in 0..27 {
        for x in 0..40 {
            assert_abs_diff_eq!(raster[[y, x]], whole.get(x as i64, y as i64), epsilon = 1e-9);
        }
    }
}

/// Two bands split into a low and a high half along x; first row masked out
fn two_class_product(width: usize, height: usize) -> Arc<Product> {
    let mut product = Product::new("features", width, height);
    let level = |c: usize| if c < width / 2 { 1.0 } else { 9.0 };
    product
        .add_band(Band::with_data(
            "band_1",
            Unit::Intensity,
            DataType::Float64,
            Array2::from_shape_fn((height, width), |(r, c)| level(c) + (r % 3) as f64 * 0.05),
        ))
        .unwrap();
    product
        .add_band(Band::with_data(
            "band_2",
            Unit::Intensity,
            DataType::Float64,
            Array2::from_shape_fn((height, width), |(r, c)| 10.0 - level(c) - (c % 2) as f64 * 0.05),
        ))
        .unwrap();
    product
        .add_band(Band::with_data(
            "roi",
            Unit::Dimensionless,
            DataType::Float64,
            Array2::from_shape_fn((height, width), |(r, _)| if r == 0 { 0.0 } else { 1.0 }),
        ))
        .unwrap();
    Arc::new(product)
}

fn kmeans_params(k: usize) -> KMeansParams {
    KMeansParams {
        cluster_count: k,
        selection: ClusterSelection {
            source_bands: vec!["band_1".into(), "band_2".into()],
            roi_mask_band: Some("roi".into()),
        },
        ..Default::default()
    }
}

#[test]
fn test_kmeans_trains_once_under_concurrent_tiles() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut op = KMeansClusterOp::with_params(kmeans_params(2));
    op.initialize(two_class_product(24, 16)).unwrap();
    let op = Arc::new(op);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let op = Arc::clone(&op);
            thread::spawn(move || {
                let rect = Rectangle::new(0, i * 2, 24, 2);
                op.compute_tile(CLASS_INDICES, &rect).unwrap()
            })
        })
        .collect();
    let tiles: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(op.training_passes(), 1);
    assert_eq!(op.state(), OperatorState::Ready);

    assert_eq!(tiles[0].get(3, 0), NO_CLASS);
    let low = tiles[3].get(2, 6);
    let high = tiles[3].get(20, 6);
    assert_ne!(low, high);
    for tile in &tiles[1..] {
        let rect = tile.rectangle();
        for y in rect.y..rect.max_y() {
            assert_eq!(tile.get(0, y), low);
            assert_eq!(tile.get(23, y), high);
        }
    }
}

#[test]
fn test_kmeans_means_are_a_fixed_point() {
    let product = two_class_product(12, 6);
    let mut op = KMeansClusterOp::with_params(kmeans_params(2));
    op.initialize(product.clone()).unwrap();
    let means: Vec<Vec<f64>> = op.clusters().unwrap().iter().map(|c| c.mean.clone()).collect();

    let b1 = product.band("band_1").unwrap().raster().unwrap().clone();
    let b2 = product.band("band_2").unwrap().raster().unwrap().clone();
    let mut acc = KMeansAccumulator::new(2, 2);
    for r in 1..6 {
        for c in 0..12 {
            acc.add(&means, &[b1[[r, c]], b2[[r, c]]]);
        }
    }
    let step = acc.finish(&means);
    assert_abs_diff_eq!(step.movement, 0.0, epsilon = 1e-18);
    assert_eq!(step.counts, vec![30, 30]);
}

#[test]
fn test_kmeans_rejects_more_clusters_than_pixels() {
    let mut op = KMeansClusterOp::with_params(kmeans_params(10));
    let err = op.initialize(two_class_product(3, 2)).unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(op.state(), OperatorState::Uninitialized);
}

const CALIBRATION_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<calibration>
  <adsHeader>
    <polarisation>VH</polarisation>
    <swath>IW2</swath>
    <startTime>2021-06-01T10:00:00.000000</startTime>
    <stopTime>2021-06-01T10:00:04.000000</stopTime>
  </adsHeader>
  <calibrationInformation>
    <absoluteCalibrationConstant>1.0</absoluteCalibrationConstant>
  </calibrationInformation>
  <calibrationVectorList count="2">
    <calibrationVector>
      <azimuthTime>2021-06-01T10:00:00.000000</azimuthTime>
      <line>0</line>
      <pixel count="2">0 5</pixel>
      <sigmaNought count="2">10.0 20.0</sigmaNought>
      <betaNought count="2">1.0 1.0</betaNought>
      <gamma count="2">2.0 2.0</gamma>
      <dn count="2">1.0 1.0</dn>
    </calibrationVector>
    <calibrationVector>
      <azimuthTime>2021-06-01T10:00:04.000000</azimuthTime>
      <line>4</line>
      <pixel count="2">0 5</pixel>
      <sigmaNought count="2">30.0 40.0</sigmaNought>
      <betaNought count="2">1.0 1.0</betaNought>
      <gamma count="2">2.0 2.0</gamma>
      <dn count="2">1.0 1.0</dn>
    </calibrationVector>
  </calibrationVectorList>
</calibration>"#;

#[test]
fn test_calibration_from_annotation_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration-s1a-iw2-slc-vh.xml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(CALIBRATION_XML.as_bytes()).unwrap();

    let mut product = Product::new("grd", 6, 5);
    product
        .add_band(Band::with_data(
            "Amplitude_VH",
            Unit::Amplitude,
            DataType::Float64,
            Array2::from_elem((5, 6), 10.0),
        ))
        .unwrap();

    let params = ParameterMap::new().with("calibrationFiles", path.display());
    let mut op = CalibrationOp::from_parameters(&params).unwrap();
    let target = op.initialize(Arc::new(product)).unwrap();
    assert_eq!(target.band_names(), vec!["Sigma0_VH"]);

    let tile = op.compute_tile("Sigma0_VH", &Rectangle::of_size(6, 5)).unwrap();
    assert_abs_diff_eq!(tile.get(0, 0), 100.0 / 100.0, epsilon = 1e-6);
    assert_abs_diff_eq!(tile.get(5, 0), 100.0 / 400.0, epsilon = 1e-6);
    assert_abs_diff_eq!(tile.get(0, 4), 100.0 / 900.0, epsilon = 1e-6);
    assert_abs_diff_eq!(tile.get(5, 4), 100.0 / 1600.0, epsilon = 1e-6);
}

#[test]
fn test_calibration_missing_file_is_configuration_error() {
    let mut product = Product::new("grd", 2, 2);
    product
        .add_band(Band::with_data("Amplitude_VH", Unit::Amplitude, DataType::Float64, Array2::ones((2, 2))))
        .unwrap();
    let params = ParameterMap::new().with("calibrationFiles", "/nonexistent/calibration.xml");
    let mut op = CalibrationOp::from_parameters(&params).unwrap();
    assert!(op.initialize(Arc::new(product)).unwrap_err().is_configuration());
}
