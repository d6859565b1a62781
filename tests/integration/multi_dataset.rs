//! Global/local fits over several datasets, in sparse and dense mode.

use approx::assert_relative_eq;
use multifit_rs::{
    model_fn, Dataset, FitData, FitLayout, IterationStatus, MultiFitConfig, MultiFitEngine,
    MultiFitModel, StopFlag,
};
use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Fraction of the oxidized form of a redox couple: `1 / (1 + exp(k (x - E0)))`.
fn nernst(p: &[f64], x: ArrayView1<'_, f64>, mut y: ArrayViewMut1<'_, f64>) -> multifit_rs::Result<()> {
    let (e0, k) = (p[0], p[1]);
    y.assign(&x.mapv(|x| 1.0 / (1.0 + (k * (x - e0)).exp())));
    Ok(())
}

fn noisy(x: &Array1<f64>, e0: f64, k: f64, rng: &mut ChaCha8Rng) -> Array1<f64> {
    x.mapv(|x| 1.0 / (1.0 + (k * (x - e0)).exp()) + rng.gen_range(-2e-3..2e-3))
}

/// Two titrations sharing `E0 = 0.02`, with slopes 20 and 30.
fn titrations() -> FitData<impl MultiFitModel> {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let x = Array1::linspace(-0.3, 0.3, 40);
    let datasets = vec![
        Dataset::new("slow", x.clone(), noisy(&x, 0.02, 20.0, &mut rng)).unwrap(),
        Dataset::new("steep", x.clone(), noisy(&x, 0.02, 30.0, &mut rng)).unwrap(),
    ];
    let layout = FitLayout::builder(2).global("E0").local("k").build().unwrap();
    let mut data = FitData::new(model_fn(nernst), datasets, layout).unwrap();
    data.set_value("E0", None, 0.0).unwrap();
    data.set_value("k", None, 15.0).unwrap();
    data
}

fn fit(sparse: bool) -> multifit_rs::FitReport {
    let data = titrations();
    let config = MultiFitConfig {
        sparse,
        ..Default::default()
    };
    MultiFitEngine::new(&data, config).unwrap().run().unwrap()
}

#[test]
fn test_shared_potential_is_recovered() {
    let report = fit(true);
    assert!(report.success(), "{}", report.message);
    assert_relative_eq!(report.values[0], 0.02, epsilon = 2e-3);
    assert_relative_eq!(report.values[1], 20.0, max_relative = 0.05);
    assert_relative_eq!(report.values[3], 30.0, max_relative = 0.05);
    // values are laid out per dataset, so E0 repeats
    assert_eq!(report.values[0], report.values[2]);
    assert!(report.errors.iter().all(|e| *e > 0.0));
}

#[test]
fn test_sparse_and_dense_fits_agree() {
    let sparse = fit(true);
    let dense = fit(false);
    assert_eq!(sparse.iterations, dense.iterations);
    for (a, b) in sparse.parameters.iter().zip(dense.parameters.iter()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-7);
    }
    assert_relative_eq!(sparse.residuals, dense.residuals, max_relative = 1e-9);

    let cs = sparse.covariance.as_ref().unwrap();
    let cd = dense.covariance.as_ref().unwrap();
    assert!(cs.is_sparse());
    assert!(!cd.is_sparse());

    let map = cs.index_map();
    let (k0, k1, e0) = (
        map.logical_index(1, 0),
        map.logical_index(1, 1),
        map.logical_index(0, 0),
    );
    for (i, j) in [(e0, e0), (k0, k0), (k1, k1), (e0, k0), (e0, k1)] {
        assert_relative_eq!(cs.get(i, j).unwrap(), cd.get(i, j).unwrap(), max_relative = 1e-5);
    }
    // The rates of distinct datasets are only correlated through E0, which
    // the block storage does not keep
    assert_eq!(cs.get(k0, k1).unwrap(), 0.0);
    assert!(cd.get(k0, k1).unwrap() != 0.0);
}

#[test]
fn test_fixed_slope_in_one_dataset() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let x = Array1::linspace(-0.3, 0.3, 30);
    let datasets = vec![
        Dataset::new("a", x.clone(), noisy(&x, -0.05, 25.0, &mut rng)).unwrap(),
        Dataset::new("b", x.clone(), noisy(&x, -0.05, 38.9, &mut rng)).unwrap(),
    ];
    let layout = FitLayout::builder(2)
        .global("E0")
        .local("k")
        .fix("k", Some(1))
        .build()
        .unwrap();
    assert_eq!(layout.free_count(), 2);
    let mut data = FitData::new(model_fn(nernst), datasets, layout).unwrap();
    data.set_value("E0", None, 0.0).unwrap();
    data.set_value("k", Some(0), 20.0).unwrap();
    data.set_value("k", Some(1), 38.9).unwrap();

    let report = MultiFitEngine::new(&data, MultiFitConfig::default())
        .unwrap()
        .run()
        .unwrap();
    assert!(report.success());
    assert_eq!(report.values[3], 38.9);
    assert_relative_eq!(report.values[0], -0.05, epsilon = 2e-3);

    let covar = report.covariance.unwrap();
    let fixed = covar.index_map().logical_index(1, 1);
    assert_eq!(covar.get(fixed, fixed).unwrap(), 0.0);
}

fn decay(p: &[f64], x: ArrayView1<'_, f64>, mut y: ArrayViewMut1<'_, f64>) -> multifit_rs::Result<()> {
    y.assign(&x.mapv(|x| p[0] * (-p[1] * x).exp()));
    Ok(())
}

#[test]
fn test_many_datasets_with_a_global_rate() {
    let n = 25;
    let x = Array1::linspace(0.0, 3.0, 15);
    let datasets = (0..n)
        .map(|i| {
            let amplitude = 1.0 + 0.1 * i as f64;
            Dataset::new(&format!("ds{}", i), x.clone(), x.mapv(|x| amplitude * (-0.8 * x).exp()))
                .unwrap()
        })
        .collect();
    let layout = FitLayout::builder(n).local("a").global("k").build().unwrap();
    assert_eq!(layout.block_sizes().len(), n + 1);
    let mut data = FitData::new(model_fn(decay), datasets, layout).unwrap();
    data.set_value("a", None, 1.0).unwrap();
    data.set_value("k", None, 0.5).unwrap();

    let linear = data.find_linear_parameters(data.initial_guess().view(), 1e-4).unwrap();
    assert_eq!(linear.len(), n);
    assert!(linear.iter().all(|&(def, _)| def == 0));

    let mut engine = MultiFitEngine::new(&data, MultiFitConfig::default()).unwrap();
    assert_eq!(engine.parameters().len(), n + 1);
    let report = engine.run().unwrap();
    assert_eq!(report.status, IterationStatus::Converged);
    assert_relative_eq!(report.parameters[0], 0.8, epsilon = 1e-6);
    for i in 0..n {
        assert_relative_eq!(report.values[2 * i], 1.0 + 0.1 * i as f64, epsilon = 1e-6);
    }
    assert_eq!(report.diagnostics.len(), report.iterations);
}

#[test]
fn test_stop_request_ends_the_fit() {
    let data = titrations();
    let stop = StopFlag::new();
    stop.request_stop();
    let report = MultiFitEngine::new(&data, MultiFitConfig::default())
        .unwrap()
        .with_stop_flag(stop.clone())
        .run()
        .unwrap();
    assert_eq!(report.status, IterationStatus::Stopped);
    assert_eq!(report.iterations, 0);
    assert!(!report.success());
}
