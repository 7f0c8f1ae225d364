pub mod batch_norm;

use crate::tensor::Tensor;

/// Layer interface: an explicit forward/backward pair with gradient buffers
/// owned by the layer.
pub trait Module {
    fn forward(&mut self, input: &Tensor) -> Tensor;

    /// Gradient of the loss with respect to `input`. Not accumulated.
    fn update_grad_input(&mut self, input: &Tensor, grad_output: &Tensor) -> Tensor;

    /// Adds `scale` times the parameter gradients to the gradient buffers.
    fn acc_grad_parameters(&mut self, input: &Tensor, grad_output: &Tensor, scale: f64);

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Tensor {
        let grad_input = self.update_grad_input(input, grad_output);
        self.acc_grad_parameters(input, grad_output, 1.0);
        grad_input
    }

    fn zero_grad_parameters(&mut self);

    /// Plain gradient descent step on every parameter.
    fn update_parameters(&mut self, learning_rate: f64);

    fn parameters(&self) -> Vec<&Tensor>;

    fn grad_parameters(&self) -> Vec<&Tensor>;

    fn train(&mut self);

    fn evaluate(&mut self);

    fn is_training(&self) -> bool;
}
