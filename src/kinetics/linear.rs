//! Closed-form evolution of linear kinetic systems `dC/dt = K C`.
//!
//! `K` is diagonalized once; the concentrations at any time are then
//! `V · diag(exp(λ t)) · V⁻¹ C₀`, which costs `O(n²)` per time point and
//! needs no integration. When `K` has no eigenbasis (equal rate constants
//! along a chain, for instance) `exp(K t) C₀` is formed directly instead.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayViewMut1};
use num_complex::Complex64;

use crate::error::{FitError, Result};
use crate::utils::matrix_convert::nalgebra_to_ndarray;

/// Eigenvalues closer than this (relative to the matrix scale) are treated
/// as one repeated eigenvalue.
const CLUSTER_TOLERANCE: f64 = 1e-10;

/// Largest singular value, relative to the matrix scale, of `K - λ I`
/// accepted along an eigenvector.
const NULL_SPACE_TOLERANCE: f64 = 1e-7;

/// Smallest accepted ratio between the extreme singular values of the
/// eigenvector matrix.
const BASIS_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct LinearKineticSystem {
    species: usize,
    kinetic_matrix: DMatrix<f64>,
    eigenvalues: DVector<Complex64>,

    /// `None` when `K` is defective
    eigenvectors: Option<DMatrix<Complex64>>,
    coordinates: DVector<Complex64>,
    initial: DVector<f64>,
    update_needed: bool,
}

impl LinearKineticSystem {
    /// A system of `species` species with all rate constants zero.
    pub fn new(species: usize) -> Result<Self> {
        if species == 0 {
            return Err(FitError::InvalidInput(
                "a kinetic system needs at least one species".to_string(),
            ));
        }
        Ok(Self {
            species,
            kinetic_matrix: DMatrix::zeros(species, species),
            eigenvalues: DVector::zeros(species),
            eigenvectors: Some(DMatrix::identity(species, species)),
            coordinates: DVector::zeros(species),
            initial: DVector::zeros(species),
            update_needed: true,
        })
    }

    pub fn species_count(&self) -> usize {
        self.species
    }

    /// The kinetic matrix `K`.
    pub fn kinetic_matrix(&self) -> Array2<f64> {
        nalgebra_to_ndarray(&self.kinetic_matrix)
    }

    /// Eigenvalues of `K`, valid once initial concentrations have been set.
    pub fn eigenvalues(&self) -> &[Complex64] {
        self.eigenvalues.as_slice()
    }

    /// Whether concentrations come from the eigenbasis of `K` rather than
    /// from its exponential.
    pub fn is_diagonalized(&self) -> bool {
        self.eigenvectors.is_some()
    }

    /// Sets the rate constants.
    ///
    /// `values[j * n + k]` is the rate constant from species `j` to species
    /// `k`. The diagonal entries and `additional_diagonal` are pure decays
    /// of their species.
    pub fn set_constants(&mut self, values: &[f64], additional_diagonal: f64) -> Result<()> {
        let n = self.species;
        if values.len() != n * n {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} rate constants, got {}",
                n * n,
                values.len()
            )));
        }
        for j in 0..n {
            let mut loss = additional_diagonal;
            for k in 0..n {
                let v = values[j * n + k];
                loss += v;
                // Flux from j to k shows up in the equation of k
                self.kinetic_matrix[(k, j)] = v;
            }
            self.kinetic_matrix[(j, j)] = -loss;
        }
        self.update_needed = true;
        Ok(())
    }

    /// Eigenvectors of `K` matching `lambdas`, or `None` if some repeated
    /// eigenvalue has a smaller eigenspace.
    fn eigenbasis(&self, lambdas: &DVector<Complex64>) -> Option<DMatrix<Complex64>> {
        let n = self.species;
        let scale = self.kinetic_matrix.amax().max(1.0);
        let complex_k = self.kinetic_matrix.map(|v| Complex64::new(v, 0.0));

        let mut assigned = vec![false; n];
        let mut eigenvectors = DMatrix::zeros(n, n);
        for i in 0..n {
            if assigned[i] {
                continue;
            }
            let cluster: Vec<usize> = (i..n)
                .filter(|&j| !assigned[j] && (lambdas[j] - lambdas[i]).norm() <= CLUSTER_TOLERANCE * scale)
                .collect();
            let lambda = lambdas[i];

            let shifted = &complex_k - DMatrix::from_diagonal_element(n, n, lambda);
            let svd = shifted.svd(false, true);
            let v_t = svd.v_t?;
            let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
            order.sort_by(|&a, &b| svd.singular_values[a].total_cmp(&svd.singular_values[b]));

            for (slot, &row) in cluster.iter().zip(order.iter()) {
                if svd.singular_values[row] > NULL_SPACE_TOLERANCE * scale {
                    debug!(
                        "eigenvalue {} has {} occurrences but a smaller eigenspace",
                        lambda,
                        cluster.len()
                    );
                    return None;
                }
                let vector = v_t.row(row).map(|c| c.conj()).transpose();
                eigenvectors.set_column(*slot, &vector);
                assigned[*slot] = true;
            }
        }
        let singular = eigenvectors.singular_values();
        if singular.min() < BASIS_TOLERANCE * singular.max() {
            debug!("eigenvectors of the kinetic matrix are nearly parallel");
            return None;
        }
        Some(eigenvectors)
    }

    fn compute_matrices(&mut self) {
        let lambdas = self.kinetic_matrix.complex_eigenvalues();
        self.eigenvectors = self.eigenbasis(&lambdas);
        if self.eigenvectors.is_none() {
            warn!("the kinetic matrix is not diagonalizable, using its exponential");
        }
        self.eigenvalues = lambdas;
        self.update_needed = false;
        debug!("eigenvalues of the kinetic matrix: {:?}", self.eigenvalues.as_slice());
    }

    /// Sets the concentrations at `t = 0`, diagonalizing `K` if the rate
    /// constants changed.
    pub fn set_initial_concentrations(&mut self, concentrations: &[f64]) -> Result<()> {
        if concentrations.len() != self.species {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} concentrations, got {}",
                self.species,
                concentrations.len()
            )));
        }
        if self.update_needed {
            self.compute_matrices();
        }
        self.initial = DVector::from_column_slice(concentrations);
        if let Some(vectors) = &self.eigenvectors {
            let c0 = self.initial.map(|c| Complex64::new(c, 0.0));
            match vectors.clone().lu().solve(&c0) {
                Some(coordinates) => self.coordinates = coordinates,
                None => {
                    warn!("the eigenvectors of the kinetic matrix do not form a basis, using its exponential");
                    self.eigenvectors = None;
                }
            }
        }
        Ok(())
    }

    /// The concentrations at time `t`.
    pub fn concentrations(&self, t: f64) -> Array1<f64> {
        let Some(vectors) = &self.eigenvectors else {
            let values = (&self.kinetic_matrix * t).exp() * &self.initial;
            return Array1::from_iter(values.iter().copied());
        };
        let weights = self
            .eigenvalues
            .zip_map(&self.coordinates, |lambda, c| (lambda * t).exp() * c);
        let values = vectors * weights;
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                if v.im.abs() > 1e-6 * (1.0 + v.re.abs()) {
                    warn!(
                        "concentration of species {} at t = {} has an imaginary part {:e}",
                        i, t, v.im
                    );
                }
                v.re
            })
            .collect()
    }

    /// Writes the concentrations at time `t` into `target`.
    pub fn concentrations_into(&self, t: f64, mut target: ArrayViewMut1<'_, f64>) -> Result<()> {
        if target.len() != self.species {
            return Err(FitError::DimensionMismatch(format!(
                "target has {} entries for {} species",
                target.len(),
                self.species
            )));
        }
        target.assign(&self.concentrations(t));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_single_species_decay() {
        let mut sys = LinearKineticSystem::new(1).unwrap();
        sys.set_constants(&[0.7], 0.0).unwrap();
        sys.set_initial_concentrations(&[2.5]).unwrap();
        for t in [0.0, 0.1, 1.0, 3.0, 10.0] {
            assert_relative_eq!(sys.concentrations(t)[0], 2.5 * (-0.7 * t).exp(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_additional_decay() {
        let mut sys = LinearKineticSystem::new(1).unwrap();
        sys.set_constants(&[0.0], 1.5).unwrap();
        sys.set_initial_concentrations(&[1.0]).unwrap();
        assert_relative_eq!(sys.concentrations(2.0)[0], (-3.0_f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_sequential_conversion() {
        // A -> B with rate 2
        let mut sys = LinearKineticSystem::new(2).unwrap();
        sys.set_constants(&[0.0, 2.0, 0.0, 0.0], 0.0).unwrap();
        assert_relative_eq!(sys.kinetic_matrix()[[1, 0]], 2.0);
        assert_relative_eq!(sys.kinetic_matrix()[[0, 0]], -2.0);
        sys.set_initial_concentrations(&[1.0, 0.0]).unwrap();
        for t in [0.0, 0.3, 2.0] {
            let c = sys.concentrations(t);
            assert_relative_eq!(c[0], (-2.0 * t).exp(), epsilon = 1e-10);
            assert_relative_eq!(c[1], 1.0 - (-2.0 * t).exp(), epsilon = 1e-10);
        }
    }

    #[test]
    fn test_branching_into_two_sinks() {
        // A -> B (1), A -> C (3): two zero eigenvalues
        let mut sys = LinearKineticSystem::new(3).unwrap();
        sys.set_constants(&[0.0, 1.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.0)
            .unwrap();
        sys.set_initial_concentrations(&[1.0, 0.0, 0.0]).unwrap();
        let t = 0.4;
        let c = sys.concentrations(t);
        let decayed = 1.0 - (-4.0 * t).exp();
        assert_relative_eq!(c[0], (-4.0 * t).exp(), epsilon = 1e-9);
        assert_relative_eq!(c[1], 0.25 * decayed, epsilon = 1e-9);
        assert_relative_eq!(c[2], 0.75 * decayed, epsilon = 1e-9);
    }

    #[test]
    fn test_cycle_with_complex_eigenvalues() {
        // A -> B -> C -> A, all with rate 1
        let mut sys = LinearKineticSystem::new(3).unwrap();
        sys.set_constants(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0], 0.0)
            .unwrap();
        sys.set_initial_concentrations(&[1.0, 0.0, 0.0]).unwrap();
        assert!(sys.eigenvalues().iter().any(|l| l.im.abs() > 0.5));
        for t in [0.5, 1.0, 4.0] {
            let c = sys.concentrations(t);
            assert_relative_eq!(c.sum(), 1.0, epsilon = 1e-10);
        }
        let c = sys.concentrations(40.0);
        for i in 0..3 {
            assert_relative_eq!(c[i], 1.0 / 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_equal_rates_along_a_chain() {
        // A -> B -> C with both rates 1: K is defective
        let mut sys = LinearKineticSystem::new(3).unwrap();
        sys.set_constants(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 0.0)
            .unwrap();
        sys.set_initial_concentrations(&[1.0, 0.0, 0.0]).unwrap();
        assert!(!sys.is_diagonalized());
        for t in [0.0, 0.5, 1.0, 3.0] {
            let c = sys.concentrations(t);
            assert_relative_eq!(c[0], (-t).exp(), epsilon = 1e-10);
            assert_relative_eq!(c[1], t * (-t).exp(), epsilon = 1e-10);
            assert_relative_eq!(c[2], 1.0 - (1.0 + t) * (-t).exp(), epsilon = 1e-10);
        }
    }

    #[test]
    fn test_nearly_equal_rates_stay_continuous() {
        let mut exact = LinearKineticSystem::new(3).unwrap();
        exact
            .set_constants(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 0.0)
            .unwrap();
        exact.set_initial_concentrations(&[1.0, 0.0, 0.0]).unwrap();

        let mut shifted = LinearKineticSystem::new(3).unwrap();
        shifted
            .set_constants(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0 + 1e-6, 0.0, 0.0, 0.0], 0.0)
            .unwrap();
        shifted.set_initial_concentrations(&[1.0, 0.0, 0.0]).unwrap();

        let (a, b) = (exact.concentrations(1.0), shifted.concentrations(1.0));
        for i in 0..3 {
            assert_relative_eq!(a[i], b[i], epsilon = 1e-5);
        }

        // Back to distinct rates, the eigenbasis is used again
        exact
            .set_constants(&[0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0], 0.0)
            .unwrap();
        exact.set_initial_concentrations(&[1.0, 0.0, 0.0]).unwrap();
        assert!(exact.is_diagonalized());
    }

    #[test]
    fn test_concentrations_into_checks_size() {
        let mut sys = LinearKineticSystem::new(2).unwrap();
        sys.set_constants(&[0.0, 2.0, 0.0, 0.0], 0.0).unwrap();
        sys.set_initial_concentrations(&[1.0, 0.0]).unwrap();
        let mut out = Array1::zeros(2);
        sys.concentrations_into(0.5, out.view_mut()).unwrap();
        assert_relative_eq!(out[0], (-1.0f64).exp(), epsilon = 1e-10);
        let mut short = Array1::zeros(1);
        assert!(sys.concentrations_into(0.5, short.view_mut()).is_err());
    }

    #[test]
    fn test_wrong_sizes() {
        assert!(LinearKineticSystem::new(0).is_err());
        let mut sys = LinearKineticSystem::new(2).unwrap();
        assert!(sys.set_constants(&[1.0], 0.0).is_err());
        assert!(sys.set_initial_concentrations(&[1.0]).is_err());
    }
}
