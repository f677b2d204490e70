use burn::prelude::*;
use burn::tensor::ElementConversion;

/// Fraction of the items whose highest logit is at the target class.
///
/// # Shapes
///   - Output [num_items, num_classes]
///   - Targets [num_items]
pub fn accuracy<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f64 {
    let [num_items, _] = output.dims();
    if num_items == 0 {
        return 0.0;
    }

    let predictions = output.argmax(1).reshape([num_items]);
    let num_corrects = predictions.equal(targets).int().sum().into_scalar();

    num_corrects.elem::<f64>() / num_items as f64
}

/// Running mean of the batch losses of one epoch.
///
/// Each loss is divided by the number of batches when it is added, so the value is the mean
/// loss once all batches have been seen.
#[derive(Clone, Debug)]
pub struct AverageCost {
    total_batches: usize,
    value: f64,
}

impl AverageCost {
    pub fn new(total_batches: usize) -> Self {
        Self {
            total_batches,
            value: 0.0,
        }
    }

    pub fn update(&mut self, loss: f64) {
        self.value += loss / self.total_batches as f64;
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
