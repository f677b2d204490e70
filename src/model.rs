use crate::params::{ParameterError, Parameters, N_CLASSES, N_HIDDEN_1, N_HIDDEN_2, N_INPUT};
use burn::{
    nn::{
        loss::CrossEntropyLossConfig,
        Initializer, Linear, LinearConfig, Relu,
    },
    prelude::*,
};

/// Multilayer perceptron with two ReLU hidden layers and a linear output layer producing logits.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    hidden_1: Linear<B>,
    hidden_2: Linear<B>,
    output: Linear<B>,
    activation: Relu,
}

#[derive(Config, Debug)]
pub struct MlpConfig {
    pub n_input: usize,
    pub n_hidden_1: usize,
    pub n_hidden_2: usize,
    pub n_classes: usize,
    /// Random normal weights and biases.
    #[config(default = "Initializer::Normal { mean: 0.0, std: 1.0 }")]
    pub initializer: Initializer,
}

/// Shape of a linear layer's weight (`[d_input, d_output]`) and bias (`[d_output]`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerShape {
    pub weight: [usize; 2],
    pub bias: Option<[usize; 1]>,
}

impl MlpConfig {
    /// Read the network widths from the parameter store.
    pub fn from_parameters(params: &Parameters) -> Result<Self, ParameterError> {
        Ok(Self::new(
            params.usize(N_INPUT)?,
            params.usize(N_HIDDEN_1)?,
            params.usize(N_HIDDEN_2)?,
            params.usize(N_CLASSES)?,
        ))
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let linear = |d_input, d_output| {
            LinearConfig::new(d_input, d_output)
                .with_bias(true)
                .with_initializer(self.initializer.clone())
                .init(device)
        };

        Mlp {
            hidden_1: linear(self.n_input, self.n_hidden_1),
            hidden_2: linear(self.n_hidden_1, self.n_hidden_2),
            output: linear(self.n_hidden_2, self.n_classes),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> Mlp<B> {
    /// # Shapes
    ///   - Images [batch_size, n_input]
    ///   - Output [batch_size, n_classes]
    pub fn forward(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.hidden_1.forward(images);
        let x = self.activation.forward(x);
        let x = self.hidden_2.forward(x);
        let x = self.activation.forward(x);

        self.output.forward(x)
    }

    /// Mean softmax cross-entropy of the logits against the target classes.
    pub fn forward_loss(&self, images: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let output = self.forward(images);

        CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output, targets)
    }

    /// Layer shapes from input to output.
    pub fn layer_shapes(&self) -> [LayerShape; 3] {
        [&self.hidden_1, &self.hidden_2, &self.output].map(|linear| LayerShape {
            weight: linear.weight.val().dims(),
            bias: linear.bias.as_ref().map(|bias| bias.val().dims()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray<f32>;

    #[test]
    fn layer_widths_compose() {
        let device = Default::default();

        for (n_input, n_hidden_1, n_hidden_2, n_classes) in
            [(784, 256, 256, 10), (3, 1, 7, 2), (1, 1, 1, 1), (16, 32, 8, 4)]
        {
            let model = MlpConfig::new(n_input, n_hidden_1, n_hidden_2, n_classes)
                .init::<TestBackend>(&device);
            let shapes = model.layer_shapes();

            assert_eq!(shapes[0].weight[0], n_input);
            assert_eq!(shapes[2].weight[1], n_classes);
            for layer in shapes.iter() {
                assert_eq!(layer.bias, Some([layer.weight[1]]));
            }
            for pair in shapes.windows(2) {
                assert_eq!(pair[0].weight[1], pair[1].weight[0]);
            }
        }
    }

    #[test]
    fn forward_produces_one_logit_per_class() {
        let device = Default::default();
        let model = MlpConfig::new(12, 8, 6, 3).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 2>::random([5, 12], Distribution::Default, &device);

        let output = model.forward(images.clone());
        let targets = Tensor::<TestBackend, 1, Int>::from_data([0, 1, 2, 1, 0], &device);
        let loss = model.forward_loss(images, targets);

        assert_eq!(output.dims(), [5, 3]);
        assert_eq!(loss.dims(), [1]);
    }

    #[test]
    fn widths_are_read_from_parameters() {
        let mut params = Parameters::default();
        params.set(N_HIDDEN_2, 64usize);

        let config = MlpConfig::from_parameters(&params).unwrap();

        assert_eq!(
            (config.n_input, config.n_hidden_1, config.n_hidden_2, config.n_classes),
            (784, 256, 64, 10)
        );
    }

    #[test]
    fn malformed_width_is_reported_at_build_time() {
        let mut params = Parameters::default();
        params.set(N_INPUT, "784");

        assert!(MlpConfig::from_parameters(&params).is_err());
    }
}
