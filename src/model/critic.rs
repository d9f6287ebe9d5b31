//! Critic network for WGAN-GP
//!
//! Scores how realistic an image looks. Unlike a DCGAN discriminator the
//! output is an unbounded scalar, not a probability.

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, nn::ModuleT, Tensor};

use super::layers::{
    conv_params, dense_params, normal_init, same_conv_output, Activation, ImageShape,
    ModelSummary, SameConv2d,
};

/// Critic network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticConfig {
    /// Shape of the images being scored
    pub input_dim: ImageShape,
    pub conv_filters: Vec<i64>,
    pub conv_kernel_size: Vec<i64>,
    pub conv_strides: Vec<i64>,
    /// Batch norm momentum ("running = m * running + (1 - m) * batch");
    /// `None` disables batch norm
    pub batch_norm_momentum: Option<f64>,
    /// Activation name, e.g. "leaky_relu"
    pub activation: String,
    /// Dropout rate; `None` disables dropout
    pub dropout_rate: Option<f64>,
}

/// Critic network
///
/// Architecture:
/// 1. Stack of same-padded Conv2D layers, each followed by optional batch
///    norm (never on the first layer), the activation and optional dropout
/// 2. Flatten and Dense layer producing one unbounded score
#[derive(Debug)]
pub struct Critic {
    config: CriticConfig,
    convs: Vec<SameConv2d>,
    batch_norms: Vec<Option<nn::BatchNorm>>,
    activation: Activation,
    fc: nn::Linear,
    summary: ModelSummary,
}

impl Critic {
    /// Weights are initialised from N(0, 0.02)
    pub fn new(vs: &nn::Path, config: CriticConfig) -> anyhow::Result<Self> {
        let activation: Activation = config.activation.parse()?;
        let init = normal_init(0.0, 0.02);

        let mut summary = ModelSummary::new("critic");
        summary.push("critic_input", "InputLayer", &config.input_dim.dims());

        let mut convs = Vec::with_capacity(config.conv_filters.len());
        let mut batch_norms = Vec::with_capacity(config.conv_filters.len());
        let mut shape = config.input_dim;

        for i in 0..config.conv_filters.len() {
            let filters = config.conv_filters[i];
            let kernel = config.conv_kernel_size[i];
            let stride = config.conv_strides[i];
            let name = format!("critic_conv_{}", i);

            convs.push(SameConv2d::new(
                vs / name.as_str(),
                shape.channels,
                filters,
                kernel,
                stride,
                Some(init),
            ));
            let out_shape = ImageShape::new(
                filters,
                same_conv_output(shape.height, stride),
                same_conv_output(shape.width, stride),
            );
            summary.push_params(
                &name,
                "Conv2D",
                &out_shape.dims(),
                conv_params(shape.channels, filters, kernel),
                0,
            );

            let bn = match enabled(config.batch_norm_momentum) {
                Some(momentum) if i > 0 => {
                    let bn_name = format!("critic_bn_{}", i);
                    summary.push_batch_norm(&bn_name, &out_shape.dims(), filters);
                    Some(nn::batch_norm2d(
                        vs / bn_name.as_str(),
                        filters,
                        batch_norm_config(momentum),
                    ))
                }
                _ => None,
            };
            batch_norms.push(bn);

            summary.push(
                &format!("activation_{}", i),
                activation.name(),
                &out_shape.dims(),
            );
            if enabled(config.dropout_rate).is_some() {
                summary.push(&format!("dropout_{}", i), "Dropout", &out_shape.dims());
            }

            shape = out_shape;
        }

        summary.push("flatten", "Flatten", &[shape.numel()]);
        let fc = nn::linear(
            vs / "critic_output",
            shape.numel(),
            1,
            nn::LinearConfig {
                ws_init: init,
                ..Default::default()
            },
        );
        summary.push_params("critic_output", "Dense", &[1], dense_params(shape.numel(), 1), 0);

        Ok(Self {
            config,
            convs,
            batch_norms,
            activation,
            fc,
            summary,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `input` - Tensor of shape (batch_size, channels, height, width)
    /// * `train` - Whether in training mode (affects batch norm and dropout)
    ///
    /// # Returns
    ///
    /// Tensor of shape (batch_size, 1) with raw critic scores
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        self.forward_with(input, train, train)
    }

    /// Forward pass while the generator trains: batch norm uses its running
    /// statistics, dropout stays active
    pub fn forward_frozen(&self, input: &Tensor) -> Tensor {
        self.forward_with(input, false, true)
    }

    fn forward_with(&self, input: &Tensor, bn_train: bool, dropout_train: bool) -> Tensor {
        let mut x = input.shallow_clone();

        for (conv, bn) in self.convs.iter().zip(&self.batch_norms) {
            x = conv.forward(&x);
            if let Some(bn) = bn {
                x = bn.forward_t(&x, bn_train);
            }
            x = self.activation.apply(&x);
            if let Some(rate) = enabled(self.config.dropout_rate) {
                x = x.dropout(rate, dropout_train);
            }
        }

        self.fc.forward(&x.flatten(1, -1))
    }

    /// Score samples in inference mode
    pub fn score(&self, input: &Tensor) -> Tensor {
        tch::no_grad(|| self.forward_t(input, false))
    }

    pub fn config(&self) -> &CriticConfig {
        &self.config
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }
}

impl ModuleT for Critic {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        Critic::forward_t(self, xs, train)
    }
}

/// Treat zero like "not set", as a falsy hyper-parameter
pub(crate) fn enabled(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

/// Convert a "keep" momentum into libtorch's "update" momentum
pub(crate) fn batch_norm_config(momentum: f64) -> nn::BatchNormConfig {
    nn::BatchNormConfig {
        momentum: 1.0 - momentum,
        eps: 1e-3,
        ..Default::default()
    }
}
