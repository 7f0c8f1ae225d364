use tracing::trace;

use crate::{nn::Module, tensor::Tensor};

#[derive(Debug, Clone)]
struct SavedStats {
    mean: Tensor,
    invstd: Tensor,
}

/// Batch normalization over dim 1 of `[N, C]`, `[N, C, L]` or `[N, C, H, W]`
/// inputs. Training normalizes with batch statistics and updates the running
/// estimates, evaluation normalizes with the running estimates.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub num_features: usize,
    pub eps: f64,
    pub momentum: Option<f64>,
    pub weight: Option<Tensor>,
    pub bias: Option<Tensor>,
    pub grad_weight: Option<Tensor>,
    pub grad_bias: Option<Tensor>,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub num_batches_tracked: usize,
    training: bool,
    saved: Option<SavedStats>,
}

// https://github.com/pytorch/pytorch/blob/main/aten/src/ATen/native/Normalization.cpp
impl BatchNorm {
    fn reduce_dims() -> Vec<usize> {
        vec![0, 2]
    }

    // [N, C, *] -> [N, C, L]
    fn channel_view(&self, x: &Tensor) -> Tensor {
        assert!(
            (2..=4).contains(&x.shape.len()),
            "expected 2d, 3d or 4d input, got shape {:?}",
            x.shape
        );
        assert_eq!(
            x.shape[1], self.num_features,
            "expected {} channels, got shape {:?}",
            self.num_features, x.shape
        );

        let length = x.shape[2..].iter().product();
        x.reshape(vec![x.shape[0], self.num_features, length])
    }

    fn per_channel(&self, t: &Tensor) -> Tensor {
        t.reshape(vec![1, self.num_features, 1])
    }

    fn running_invstd(&self) -> Tensor {
        self.per_channel(&(&self.running_var + self.eps).rsqrt())
    }

    fn affine_transform(&self, xhat: Tensor) -> Tensor {
        match (&self.weight, &self.bias) {
            (Some(weight), Some(bias)) => {
                xhat * self.per_channel(weight) + self.per_channel(bias)
            }
            _ => xhat,
        }
    }

    fn update_running_stats(&mut self, mean: &Tensor, var_sum: &Tensor, count: usize) {
        self.num_batches_tracked += 1;
        let factor = match self.momentum {
            Some(momentum) => momentum,
            None => 1.0 / self.num_batches_tracked as f64,
        };

        let mean = mean.reshape(vec![self.num_features]);
        let unbiased_var = var_sum.reshape(vec![self.num_features]) / (count - 1) as f64;

        self.running_mean = mean * factor + &self.running_mean * (1.0 - factor);
        self.running_var = unbiased_var * factor + &self.running_var * (1.0 - factor);
    }

    // Mean and inverse std the last forward normalized with, as [1, C, 1].
    fn normalization_stats(&self) -> (Tensor, Tensor) {
        if self.training {
            match &self.saved {
                Some(saved) => (saved.mean.clone(), saved.invstd.clone()),
                None => panic!("backward called before a training forward"),
            }
        } else {
            (self.per_channel(&self.running_mean), self.running_invstd())
        }
    }

    fn zeros_like_parameters(&self) -> (Option<Tensor>, Option<Tensor>) {
        match (&self.weight, &self.bias) {
            (Some(_), Some(_)) => (
                Some(Tensor::zeros(self.num_features)),
                Some(Tensor::zeros(self.num_features)),
            ),
            _ => (None, None),
        }
    }
}

impl Module for BatchNorm {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        trace!(
            "batch norm forward, shape {:?}, training {}",
            input.shape,
            self.training
        );

        let x = self.channel_view(input);
        let dims = BatchNorm::reduce_dims();

        let xhat = if self.training {
            let count = x.numel() / self.num_features;
            assert!(
                count > 1,
                "expected more than 1 value per channel when training, got shape {:?}",
                input.shape
            );

            let mean = x.reduce_mean(Some(&dims), true, None);
            let centered = &x - &mean;
            let var_sum = (&centered * &centered).reduce_sum(Some(&dims), true);
            let invstd = (&var_sum / count as f64 + self.eps).rsqrt();

            self.update_running_stats(&mean, &var_sum, count);
            let xhat = centered * invstd.clone();
            self.saved = Some(SavedStats { mean, invstd });
            xhat
        } else {
            self.saved = None;
            (&x - &self.per_channel(&self.running_mean)) * self.running_invstd()
        };

        self.affine_transform(xhat).reshape(input.shape.clone())
    }

    fn update_grad_input(&mut self, input: &Tensor, grad_output: &Tensor) -> Tensor {
        assert_eq!(
            input.shape, grad_output.shape,
            "grad_output shape does not match input"
        );
        trace!("batch norm backward, shape {:?}", input.shape);

        let x = self.channel_view(input);
        let g = self.channel_view(grad_output);
        let (mean, invstd) = self.normalization_stats();
        let scale = match &self.weight {
            Some(weight) => &invstd * &self.per_channel(weight),
            None => invstd.clone(),
        };

        let grad_input = if self.training {
            let dims = BatchNorm::reduce_dims();
            let xhat = (&x - &mean) * invstd;
            let g_mean = g.reduce_mean(Some(&dims), true, None);
            let projection = (&g * &xhat).reduce_mean(Some(&dims), true, None);
            (g - g_mean - xhat * projection) * scale
        } else {
            g * scale
        };

        grad_input.reshape(input.shape.clone())
    }

    fn acc_grad_parameters(&mut self, input: &Tensor, grad_output: &Tensor, scale: f64) {
        if self.grad_weight.is_none() || self.grad_bias.is_none() {
            return;
        }

        let x = self.channel_view(input);
        let g = self.channel_view(grad_output);
        let (mean, invstd) = self.normalization_stats();
        let dims = BatchNorm::reduce_dims();

        let xhat = (x - mean) * invstd;
        let weight_step = (&g * &xhat).reduce_sum(Some(&dims), false) * scale;
        let bias_step = g.reduce_sum(Some(&dims), false) * scale;

        self.grad_weight = self.grad_weight.take().map(|grad| grad + weight_step);
        self.grad_bias = self.grad_bias.take().map(|grad| grad + bias_step);
    }

    fn zero_grad_parameters(&mut self) {
        (self.grad_weight, self.grad_bias) = self.zeros_like_parameters();
    }

    fn update_parameters(&mut self, learning_rate: f64) {
        if let (Some(weight), Some(grad)) = (self.weight.as_mut(), &self.grad_weight) {
            *weight = &*weight - &(grad * learning_rate);
        }
        if let (Some(bias), Some(grad)) = (self.bias.as_mut(), &self.grad_bias) {
            *bias = &*bias - &(grad * learning_rate);
        }
    }

    fn parameters(&self) -> Vec<&Tensor> {
        [&self.weight, &self.bias]
            .into_iter()
            .filter_map(Option::as_ref)
            .collect()
    }

    fn grad_parameters(&self) -> Vec<&Tensor> {
        [&self.grad_weight, &self.grad_bias]
            .into_iter()
            .filter_map(Option::as_ref)
            .collect()
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn evaluate(&mut self) {
        self.training = false;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

pub struct BatchNormBuilder {
    num_features: usize,
    eps: f64,
    momentum: Option<f64>,
    affine: bool,
}

impl BatchNormBuilder {
    pub fn new(num_features: usize) -> BatchNormBuilder {
        BatchNormBuilder {
            num_features,
            eps: 1e-5,
            momentum: Some(0.1),
            affine: true,
        }
    }

    pub fn eps(mut self, eps: f64) -> BatchNormBuilder {
        self.eps = eps;
        self
    }

    /// `None` switches the running estimates to a cumulative average.
    pub fn momentum(mut self, momentum: Option<f64>) -> BatchNormBuilder {
        self.momentum = momentum;
        self
    }

    pub fn affine(mut self, affine: bool) -> BatchNormBuilder {
        self.affine = affine;
        self
    }

    pub fn build(self) -> BatchNorm {
        assert!(self.num_features > 0, "num_features must be positive");

        let (weight, bias) = if self.affine {
            (
                Some(Tensor::ones(self.num_features)),
                Some(Tensor::zeros(self.num_features)),
            )
        } else {
            (None, None)
        };

        let mut bn = BatchNorm {
            num_features: self.num_features,
            eps: self.eps,
            momentum: self.momentum,
            weight,
            bias,
            grad_weight: None,
            grad_bias: None,
            running_mean: Tensor::zeros(self.num_features),
            running_var: Tensor::ones(self.num_features),
            num_batches_tracked: 0,
            training: true,
            saved: None,
        };
        bn.zero_grad_parameters();
        bn
    }
}
