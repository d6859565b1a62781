//! Kinetic evaluators checked against each other, and used as fit models.

use approx::assert_relative_eq;
use multifit_rs::kinetics::{
    KineticSystem, KineticSystemEvolver, KineticSystemSteadyState, LinearKineticSystem,
    OdeStepperOptions,
};
use multifit_rs::{model_fn, Dataset, FitData, FitLayout, MultiFitConfig, MultiFitEngine};
use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use std::collections::HashMap;

#[test]
fn test_closed_form_matches_integration() {
    // A -> B (k1 = 1.2), B -> C (k2 = 0.4), A -> C (k3 = 0.3)
    let mut linear = LinearKineticSystem::new(3).unwrap();
    linear
        .set_constants(&[0.0, 1.2, 0.3, 0.0, 0.0, 0.4, 0.0, 0.0, 0.0], 0.0)
        .unwrap();
    linear.set_initial_concentrations(&[1.0, 0.2, 0.0]).unwrap();

    let system = KineticSystem::parse("A ->[k1] B\nB ->[k2] C\nA ->[k3] C").unwrap();
    let mut evolver = KineticSystemEvolver::new(&system);
    evolver.set_stepper_options(OdeStepperOptions::default().with_tolerances(1e-11, 1e-11));
    let missing = evolver.set_parameters(&HashMap::from([
        ("k1".to_string(), 1.2),
        ("k2".to_string(), 0.4),
        ("k3".to_string(), 0.3),
        ("c0_A".to_string(), 1.0),
        ("c0_B".to_string(), 0.2),
        ("c0_C".to_string(), 0.0),
    ]));
    assert!(missing.is_empty());
    evolver.initialize(0.0).unwrap();

    let times = [0.1, 0.5, 1.0, 2.5, 6.0];
    let integrated = evolver.steps(&times).unwrap();
    for (i, &t) in times.iter().enumerate() {
        let exact = linear.concentrations(t);
        for s in 0..3 {
            assert_relative_eq!(integrated[s][i], exact[s], epsilon = 1e-8);
        }
        assert_relative_eq!(exact.sum(), 1.2, epsilon = 1e-10);
    }
}

#[test]
fn test_equal_rates_match_integration() {
    // A -> B -> C with k1 = k2 = 0.8, the starting point of many fits
    let mut linear = LinearKineticSystem::new(3).unwrap();
    linear
        .set_constants(&[0.0, 0.8, 0.0, 0.0, 0.0, 0.8, 0.0, 0.0, 0.0], 0.0)
        .unwrap();
    linear.set_initial_concentrations(&[1.0, 0.0, 0.0]).unwrap();

    let system = KineticSystem::parse("A ->[k] B\nB ->[k] C").unwrap();
    let mut evolver = KineticSystemEvolver::new(&system);
    evolver.set_stepper_options(OdeStepperOptions::default().with_tolerances(1e-11, 1e-11));
    evolver.set_parameter("k", 0.8).unwrap();
    evolver.set_parameter("c0_A", 1.0).unwrap();
    evolver.initialize(0.0).unwrap();

    let times = [0.25, 1.0, 4.0];
    let integrated = evolver.steps(&times).unwrap();
    for (i, &t) in times.iter().enumerate() {
        let exact = linear.concentrations(t);
        assert_relative_eq!(exact[1], 0.8 * t * (-0.8 * t).exp(), epsilon = 1e-10);
        for s in 0..3 {
            assert_relative_eq!(integrated[s][i], exact[s], epsilon = 1e-8);
        }
    }
}

#[test]
fn test_fixed_step_mode_converges_too() {
    let system = KineticSystem::parse("2 A ->[k] B").unwrap();
    let mut evolver = KineticSystemEvolver::new(&system);
    evolver.set_stepper_options(OdeStepperOptions::fixed(1e-3));
    evolver.set_parameter("k", 0.5).unwrap();
    evolver.set_parameter("c0_A", 1.0).unwrap();
    evolver.initialize(0.0).unwrap();
    evolver.step_to(2.0).unwrap();
    // dA/dt = -2 k A², so A = 1 / (1 + 2 k t)
    assert_relative_eq!(evolver.concentrations()[0], 1.0 / 3.0, epsilon = 1e-9);
    assert_relative_eq!(evolver.concentrations()[1], 1.0 / 3.0, epsilon = 1e-9);
}

/// Concentration of the intermediate `B` of `A -> B -> C`, starting from
/// pure `A` at concentration `p[2]`.
fn intermediate(p: &[f64], t: ArrayView1<'_, f64>, mut y: ArrayViewMut1<'_, f64>) -> multifit_rs::Result<()> {
    let mut system = LinearKineticSystem::new(3)?;
    system.set_constants(&[0.0, p[0], 0.0, 0.0, 0.0, p[1], 0.0, 0.0, 0.0], 0.0)?;
    system.set_initial_concentrations(&[p[2], 0.0, 0.0])?;
    for (target, &ti) in y.iter_mut().zip(t.iter()) {
        *target = system.concentrations(ti)[1];
    }
    Ok(())
}

#[test]
fn test_fit_of_an_intermediate() {
    let (k1, k2) = (2.0, 0.5);
    let t = Array1::linspace(0.0, 6.0, 30);
    let curve = |c0: f64| t.mapv(|t| c0 * k1 / (k2 - k1) * ((-k1 * t).exp() - (-k2 * t).exp()));
    let datasets = vec![
        Dataset::new("low", t.clone(), curve(0.5)).unwrap(),
        Dataset::new("high", t.clone(), curve(2.0)).unwrap(),
    ];
    let layout = FitLayout::builder(2)
        .global("k1")
        .global("k2")
        .local("c0")
        .build()
        .unwrap();
    let mut data = FitData::new(model_fn(intermediate), datasets, layout).unwrap();
    data.set_value("k1", None, 1.5).unwrap();
    data.set_value("k2", None, 0.7).unwrap();
    data.set_value("c0", None, 1.0).unwrap();

    let report = MultiFitEngine::new(&data, MultiFitConfig::default())
        .unwrap()
        .run()
        .unwrap();
    assert!(report.success(), "{}", report.message);
    assert!(report.residuals < 1e-6);

    // The curve of B is symmetric in the two rates up to its amplitude
    let mut rates = [report.values[0], report.values[1]];
    rates.sort_by(f64::total_cmp);
    assert_relative_eq!(rates[0], k2, max_relative = 1e-5);
    assert_relative_eq!(rates[1], k1, max_relative = 1e-5);
}

#[test]
fn test_reversible_wave_is_a_nernstian_sigmoid() {
    let mut system = KineticSystem::parse("Ox + e- <=>[e0][k0] Red\nRed ->[kc] Ox").unwrap();
    system.prepare_for_steady_state().unwrap();
    let mut ss = KineticSystemSteadyState::new(&system).unwrap();
    ss.set_parameters_from_str("e0 = -0.1; k0 = 1e3; kc = 1e-3; c_tot = 1; temperature = 298.15")
        .unwrap();

    let potentials: Vec<f64> = (0..41).map(|i| 0.1 - 0.005 * i as f64).collect();
    let v = ss.compute_voltammogram(&potentials).unwrap();
    assert_eq!(v.currents.len(), potentials.len());

    // With fast electron transfer, the couple stays at equilibrium
    let f = multifit_rs::kinetics::FARADAY / (multifit_rs::kinetics::GAS_CONSTANT * 298.15);
    for (i, &e) in potentials.iter().enumerate() {
        let ox = 1.0 / (1.0 + (-f * (e + 0.1)).exp());
        assert_relative_eq!(v.concentrations[0][i], ox, epsilon = 1e-5);
        assert_relative_eq!(v.concentrations[0][i] + v.concentrations[1][i], 1.0, epsilon = 1e-9);
    }
    // The catalytic current grows monotonically as the potential goes down
    for w in v.currents.windows(2) {
        assert!(w[1] >= w[0]);
    }
}
