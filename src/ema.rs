use candle_core::{Tensor, Var};

use crate::TrainingError;

/// Exponential moving average of the model parameters.
///
/// The shadow is rebuilt every epoch. After an epoch's training batches it is
/// swapped into the live variables for validation and checkpointing; the
/// replaced values are kept in a restore buffer until the next epoch starts.
#[derive(Debug, Clone, Default)]
pub struct ParameterEma {
    decay: Option<f64>,
    shadow: Option<Vec<Tensor>>,
    restore: Option<Vec<Tensor>>,
}

impl ParameterEma {
    pub fn new(decay: Option<f64>) -> Self {
        Self {
            decay,
            shadow: None,
            restore: None,
        }
    }

    pub fn decay(&self) -> Option<f64> {
        self.decay
    }

    pub fn shadow(&self) -> Option<&[Tensor]> {
        self.shadow.as_deref()
    }

    /// True while the shadow values are swapped into the model.
    pub fn is_applied(&self) -> bool {
        self.restore.is_some()
    }

    /// Drops the shadow; the next [`ParameterEma::seed`] starts over.
    pub fn reset(&mut self) {
        self.shadow = None;
    }

    /// Copies the current parameters into the shadow if EMA is enabled and
    /// the shadow is not yet initialized. Returns whether it seeded.
    pub fn seed(&mut self, params: &[Var]) -> Result<bool, TrainingError> {
        if self.shadow.is_some() || self.decay.is_none() {
            return Ok(false);
        }
        self.shadow = Some(snapshot(params)?);
        Ok(true)
    }

    /// `shadow = shadow * (1 - decay) + decay * param` for every parameter.
    pub fn step(&mut self, params: &[Var]) -> Result<(), TrainingError> {
        let (Some(decay), Some(shadow)) = (self.decay, self.shadow.as_mut()) else {
            return Ok(());
        };
        ensure_aligned(params.len(), shadow.len())?;

        for (param, shadow_value) in params.iter().zip(shadow.iter_mut()) {
            let current = param.as_tensor().detach();
            let decayed = shadow_value.affine(1.0 - decay, 0.0)?;
            let pulled = current.affine(decay, 0.0)?;
            *shadow_value = (decayed + pulled)?;
        }
        Ok(())
    }

    /// Saves the live parameters and overwrites them with the shadow.
    pub fn apply(&mut self, params: &[Var]) -> Result<(), TrainingError> {
        let Some(shadow) = self.shadow.as_ref() else {
            return Ok(());
        };
        ensure_aligned(params.len(), shadow.len())?;

        log::info!("applying ema");
        self.restore = Some(snapshot(params)?);
        for (param, shadow_value) in params.iter().zip(shadow) {
            param.set(shadow_value)?;
        }
        Ok(())
    }

    /// Writes the values saved by [`ParameterEma::apply`] back into the model.
    pub fn restore(&mut self, params: &[Var]) -> Result<(), TrainingError> {
        let Some(saved) = self.restore.take() else {
            return Ok(());
        };
        ensure_aligned(params.len(), saved.len())?;

        log::info!("restoring params from before ema");
        for (param, value) in params.iter().zip(&saved) {
            param.set(value)?;
        }
        Ok(())
    }
}

/// Deep copies of the variables' current values.
fn snapshot(params: &[Var]) -> Result<Vec<Tensor>, TrainingError> {
    params
        .iter()
        .map(|param| param.as_tensor().detach().copy().map_err(TrainingError::from))
        .collect()
}

fn ensure_aligned(params: usize, stored: usize) -> Result<(), TrainingError> {
    if params != stored {
        return Err(TrainingError::runtime(format!(
            "ema holds {stored} tensor(s) but the model has {params} parameter(s)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params(values: &[&[f32]]) -> Vec<Var> {
        values
            .iter()
            .map(|v| Var::new(*v, &Device::Cpu).unwrap())
            .collect()
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn disabled_ema_never_seeds() {
        let vars = params(&[&[1.0, 2.0]]);
        let mut ema = ParameterEma::new(None);
        assert!(!ema.seed(&vars).unwrap());
        ema.step(&vars).unwrap();
        ema.apply(&vars).unwrap();
        ema.restore(&vars).unwrap();
        assert!(ema.shadow().is_none());
        assert!(!ema.is_applied());
        assert_eq!(values(&vars[0]), vec![1.0, 2.0]);
    }

    #[test]
    fn seeding_happens_once_per_reset() {
        let vars = params(&[&[1.0]]);
        let mut ema = ParameterEma::new(Some(0.5));
        assert!(ema.seed(&vars).unwrap());
        vars[0].set(&Tensor::new(&[3.0f32], &Device::Cpu).unwrap()).unwrap();
        assert!(!ema.seed(&vars).unwrap());
        assert_eq!(ema.shadow().unwrap()[0].to_vec1::<f32>().unwrap(), vec![1.0]);

        ema.reset();
        assert!(ema.seed(&vars).unwrap());
        assert_eq!(ema.shadow().unwrap()[0].to_vec1::<f32>().unwrap(), vec![3.0]);
    }

    #[test]
    fn step_follows_the_recurrence() {
        let vars = params(&[&[0.0, 4.0]]);
        let mut ema = ParameterEma::new(Some(0.25));
        ema.seed(&vars).unwrap();
        vars[0].set(&Tensor::new(&[8.0f32, 0.0], &Device::Cpu).unwrap()).unwrap();

        ema.step(&vars).unwrap();
        let shadow = ema.shadow().unwrap()[0].to_vec1::<f32>().unwrap();
        assert!((shadow[0] - (0.0 * 0.75 + 0.25 * 8.0)).abs() < 1e-6);
        assert!((shadow[1] - (4.0 * 0.75 + 0.25 * 0.0)).abs() < 1e-6);
    }

    #[test]
    fn shadow_converges_monotonically_to_constant_params() {
        let vars = params(&[&[0.0]]);
        let mut ema = ParameterEma::new(Some(0.1));
        ema.seed(&vars).unwrap();
        vars[0].set(&Tensor::new(&[1.0f32], &Device::Cpu).unwrap()).unwrap();

        let mut previous_gap = 1.0f32;
        for _ in 0..50 {
            ema.step(&vars).unwrap();
            let value = ema.shadow().unwrap()[0].to_vec1::<f32>().unwrap()[0];
            let gap = 1.0 - value;
            assert!(gap >= 0.0 && gap < previous_gap);
            previous_gap = gap;
        }
        assert!(previous_gap < 0.01);
    }

    #[test]
    fn apply_then_restore_is_bit_exact() {
        let vars = params(&[&[0.1, -7.3, 1e-20], &[3.333_333]]);
        let before: Vec<Vec<f32>> = vars.iter().map(values).collect();

        let mut ema = ParameterEma::new(Some(0.3));
        ema.seed(&vars).unwrap();
        vars[0]
            .set(&Tensor::new(&[9.0f32, 9.0, 9.0], &Device::Cpu).unwrap())
            .unwrap();
        ema.step(&vars).unwrap();
        let live: Vec<Vec<f32>> = vars.iter().map(values).collect();

        ema.apply(&vars).unwrap();
        assert!(ema.is_applied());
        let applied: Vec<Vec<f32>> = vars.iter().map(values).collect();
        let shadow: Vec<Vec<f32>> = ema
            .shadow()
            .unwrap()
            .iter()
            .map(|t| t.to_vec1::<f32>().unwrap())
            .collect();
        assert_eq!(applied, shadow);

        ema.restore(&vars).unwrap();
        assert!(!ema.is_applied());
        let restored: Vec<Vec<f32>> = vars.iter().map(values).collect();
        assert_eq!(
            restored.iter().flatten().map(|v| v.to_bits()).collect::<Vec<_>>(),
            live.iter().flatten().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
        assert_ne!(restored, before);
    }
}
