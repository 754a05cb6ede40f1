use candle_core::{DType, Tensor};

use crate::TrainingError;

/// Loss functor for one model head.
///
/// A head may produce several sub-losses (for example a confidence term and a
/// regression term). `None` marks a sub-loss that does not apply to the
/// current batch, such as a regression term on a batch without annotations.
pub trait HeadLoss {
    fn compute(
        &self,
        output: &Tensor,
        targets: &[Tensor],
    ) -> candle_core::Result<Vec<Option<Tensor>>>;
}

impl<F> HeadLoss for F
where
    F: Fn(&Tensor, &[Tensor]) -> candle_core::Result<Vec<Option<Tensor>>>,
{
    fn compute(
        &self,
        output: &Tensor,
        targets: &[Tensor],
    ) -> candle_core::Result<Vec<Option<Tensor>>> {
        self(output, targets)
    }
}

/// Result of [`MultiHeadLoss::compute`], still attached to the graph.
#[derive(Debug, Clone)]
pub struct CombinedLoss {
    /// Weighted sum of every non-null sub-loss; `None` when all are null.
    pub total: Option<Tensor>,
    /// Sub-losses flattened in head order, aligned with the lambdas.
    pub head_losses: Vec<Option<Tensor>>,
}

impl CombinedLoss {
    /// Detaches the losses into plain scalars.
    pub fn values(&self) -> Result<LossValues, TrainingError> {
        let total = self.total.as_ref().map(scalar_value).transpose()?;
        let heads = self
            .head_losses
            .iter()
            .map(|loss| loss.as_ref().map(scalar_value).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LossValues { total, heads })
    }
}

/// Scalar loss values for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct LossValues {
    pub total: Option<f64>,
    pub heads: Vec<Option<f64>>,
}

/// Per-head loss functors combined with fixed lambda weights.
pub struct MultiHeadLoss {
    heads: Vec<Box<dyn HeadLoss>>,
    lambdas: Vec<f64>,
}

impl MultiHeadLoss {
    pub fn new(heads: Vec<Box<dyn HeadLoss>>, lambdas: Vec<f64>) -> Result<Self, TrainingError> {
        if heads.is_empty() {
            return Err(TrainingError::initialization(
                "at least one loss head is required",
            ));
        }
        if lambdas.is_empty() {
            return Err(TrainingError::initialization(
                "at least one lambda is required",
            ));
        }
        Ok(Self { heads, lambdas })
    }

    pub fn lambdas(&self) -> &[f64] {
        &self.lambdas
    }

    /// Evaluates every head on its output and target group and sums the
    /// weighted sub-losses.
    pub fn compute(
        &self,
        outputs: &[Tensor],
        targets: &[Vec<Tensor>],
    ) -> Result<CombinedLoss, TrainingError> {
        if outputs.len() != self.heads.len() || targets.len() != outputs.len() {
            return Err(TrainingError::HeadCount {
                heads: self.heads.len(),
                outputs: outputs.len(),
                targets: targets.len(),
            });
        }

        let mut head_losses = Vec::with_capacity(self.lambdas.len());
        for ((head, output), target) in self.heads.iter().zip(outputs).zip(targets) {
            head_losses.extend(head.compute(output, target)?);
        }

        if head_losses.len() != self.lambdas.len() {
            return Err(TrainingError::LossArity {
                lambdas: self.lambdas.len(),
                sub_losses: head_losses.len(),
            });
        }

        let mut total: Option<Tensor> = None;
        for (lambda, loss) in self.lambdas.iter().zip(&head_losses) {
            let Some(loss) = loss else {
                continue;
            };
            let weighted = loss.sum_all()?.affine(*lambda, 0.0)?;
            total = Some(match total {
                Some(sum) => (sum + weighted)?,
                None => weighted,
            });
        }

        Ok(CombinedLoss { total, head_losses })
    }
}

fn scalar_value(tensor: &Tensor) -> Result<f64, TrainingError> {
    Ok(tensor
        .detach()
        .sum_all()?
        .to_dtype(DType::F64)?
        .to_vec0::<f64>()?)
}
