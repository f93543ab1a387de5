//! Lagrange multipliers for the constraint set.
//!
//! One non-negative multiplier per constraint, stored as a trainable `Var` so
//! the same damped term can be differentiated with respect to the relaxed
//! target (primal penalty) and with respect to the multipliers (dual ascent).

use candle_core::{DType, Device, Result, Tensor, Var};

/// Multiplier state for `count` constraints, initialized to zero.
pub struct LagrangeMultipliers {
    lambdas: Var,
    count: usize,
}

impl LagrangeMultipliers {
    /// Create `count` zero multipliers.
    ///
    /// # Errors
    /// Returns an error if the tensor cannot be allocated on `device`.
    pub fn new(count: usize, device: &Device) -> Result<Self> {
        let lambdas = Var::zeros(count, DType::F32, device)?;
        Ok(Self { lambdas, count })
    }

    /// Create multipliers with explicit starting values.
    ///
    /// # Errors
    /// Returns an error if the tensor cannot be allocated on `device`.
    pub fn from_values(values: &[f32], device: &Device) -> Result<Self> {
        let lambdas = Var::from_tensor(&Tensor::new(values, device)?)?;
        Ok(Self {
            lambdas,
            count: values.len(),
        })
    }

    /// Number of constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The trainable variable, for the dual optimizer.
    #[must_use]
    pub fn var(&self) -> &Var {
        &self.lambdas
    }

    /// Current multiplier values.
    ///
    /// # Errors
    /// Returns an error if the values cannot be copied off the device.
    pub fn values(&self) -> Result<Vec<f64>> {
        Ok(self
            .lambdas
            .as_tensor()
            .to_vec1::<f32>()?
            .into_iter()
            .map(f64::from)
            .collect())
    }

    /// Damped Lagrangian term `(λ_i − damp) · violation` for constraint `index`.
    ///
    /// `damp` is `dampness · violation` computed on detached values, so the
    /// term expands to `λ·v − dampness·v̄·v`. `damp` and `violation` are
    /// per-example tensors of shape `(batch,)`.
    ///
    /// # Errors
    /// Returns an error if `index` is out of range or shapes do not broadcast.
    pub fn get_loss(&self, index: usize, damp: &Tensor, violation: &Tensor) -> Result<Tensor> {
        if index >= self.count {
            candle_core::bail!(
                "constraint index {index} out of range for {} multipliers",
                self.count
            );
        }
        let lambda = self.lambdas.as_tensor().narrow(0, index, 1)?;
        let coeff = lambda.broadcast_sub(damp)?;
        coeff.broadcast_mul(violation)
    }

    /// Project every multiplier onto `[0, ∞)`.
    ///
    /// # Errors
    /// Returns an error if the update cannot be written back.
    pub fn make_positive(&self) -> Result<()> {
        let clamped = self.lambdas.as_tensor().relu()?;
        self.lambdas.set(&clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zero() {
        let device = Device::Cpu;
        let m = LagrangeMultipliers::new(3, &device).unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.values().unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_make_positive_clamps_and_is_idempotent() {
        let device = Device::Cpu;
        let m = LagrangeMultipliers::from_values(&[-1.5, 0.0, 2.0], &device).unwrap();
        m.make_positive().unwrap();
        let once = m.values().unwrap();
        assert_eq!(once, vec![0.0, 0.0, 2.0]);
        m.make_positive().unwrap();
        assert_eq!(m.values().unwrap(), once);
    }

    #[test]
    fn test_make_positive_is_monotone() {
        let device = Device::Cpu;
        let low = LagrangeMultipliers::from_values(&[-3.0, 0.5, 1.0], &device).unwrap();
        let high = LagrangeMultipliers::from_values(&[-1.0, 0.75, 4.0], &device).unwrap();
        low.make_positive().unwrap();
        high.make_positive().unwrap();
        for (a, b) in low.values().unwrap().iter().zip(high.values().unwrap()) {
            assert!(*a <= b);
        }
    }

    #[test]
    fn test_get_loss_damped_form() {
        let device = Device::Cpu;
        let m = LagrangeMultipliers::from_values(&[2.0], &device).unwrap();
        let violation = Tensor::new(&[-0.5f32, 1.0], &device).unwrap();
        let damp = (violation.detach() * 0.1).unwrap();
        let loss = m.get_loss(0, &damp, &violation).unwrap();
        let got = loss.to_vec1::<f32>().unwrap();
        // (2 - 0.1 * v) * v
        assert!((got[0] - (2.0 + 0.05) * -0.5).abs() < 1e-6);
        assert!((got[1] - (2.0 - 0.1) * 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dual_gradient_is_negative_violation() {
        let device = Device::Cpu;
        let m = LagrangeMultipliers::new(1, &device).unwrap();
        // threshold 1.0, constraint loss 3.0 -> violation -2.0
        let violation = Tensor::new(&[-2.0f32], &device).unwrap();
        let damp = violation.zeros_like().unwrap();
        let dual = m.get_loss(0, &damp, &violation).unwrap().neg().unwrap().sum_all().unwrap();
        let grads = dual.backward().unwrap();
        let g = grads.get(m.var().as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        // Ascent along +2.0 raises the multiplier for a violated constraint.
        assert!((g[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_get_loss_out_of_range() {
        let device = Device::Cpu;
        let m = LagrangeMultipliers::new(1, &device).unwrap();
        let v = Tensor::new(&[0.0f32], &device).unwrap();
        assert!(m.get_loss(1, &v, &v).is_err());
    }
}
