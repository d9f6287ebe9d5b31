//! Generator network for WGAN-GP
//!
//! Maps latent noise vectors to images. A dense projection is reshaped into
//! a small feature map that is grown either by nearest-neighbour upsampling
//! followed by a convolution, or by a strided transposed convolution.

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, nn::ModuleT, Device, Kind, Tensor};

use super::critic::{batch_norm_config, enabled};
use super::layers::{
    conv_params, dense_params, normal_init, upsample_nearest2x, Activation, ImageShape,
    ModelSummary, SameConv2d, SameConvTranspose2d,
};

/// Generator network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Size of the latent noise vector
    pub z_dim: i64,
    /// Feature map the dense projection is reshaped into
    pub initial_dense_layer_size: ImageShape,
    /// 2 selects upsample + conv for a layer, anything else a transposed conv
    pub upsample: Vec<i64>,
    pub conv_filters: Vec<i64>,
    pub conv_kernel_size: Vec<i64>,
    pub conv_strides: Vec<i64>,
    /// `None` disables batch norm
    pub batch_norm_momentum: Option<f64>,
    pub activation: String,
    /// `None` disables dropout after the reshape
    pub dropout_rate: Option<f64>,
}

impl GeneratorConfig {
    /// Shape of the generated images
    pub fn output_shape(&self) -> ImageShape {
        let mut shape = self.initial_dense_layer_size;
        for i in 0..self.conv_filters.len() {
            let scale = if self.upsample[i] == 2 {
                2
            } else {
                self.conv_strides[i]
            };
            shape = ImageShape::new(
                self.conv_filters[i],
                shape.height * scale,
                shape.width * scale,
            );
        }
        shape
    }
}

#[derive(Debug)]
enum GrowLayer {
    /// Nearest 2x upsampling then a stride-1 convolution
    Upsample(SameConv2d),
    Transpose(SameConvTranspose2d),
}

impl GrowLayer {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            GrowLayer::Upsample(conv) => conv.forward(&upsample_nearest2x(xs)),
            GrowLayer::Transpose(conv) => conv.forward(xs),
        }
    }
}

/// Generator network
#[derive(Debug)]
pub struct Generator {
    config: GeneratorConfig,
    fc: nn::Linear,
    fc_bn: Option<nn::BatchNorm>,
    layers: Vec<GrowLayer>,
    batch_norms: Vec<Option<nn::BatchNorm>>,
    activation: Activation,
    summary: ModelSummary,
}

impl Generator {
    /// Weights are initialised from N(0, 0.02)
    pub fn new(vs: &nn::Path, config: GeneratorConfig) -> anyhow::Result<Self> {
        let activation: Activation = config.activation.parse()?;
        let init = normal_init(0.0, 0.02);
        let momentum = enabled(config.batch_norm_momentum);
        let initial = config.initial_dense_layer_size;

        let mut summary = ModelSummary::new("generator");
        summary.push("generator_input", "InputLayer", &[config.z_dim]);

        let fc = nn::linear(
            vs / "generator_dense",
            config.z_dim,
            initial.numel(),
            nn::LinearConfig {
                ws_init: init,
                ..Default::default()
            },
        );
        summary.push_params(
            "generator_dense",
            "Dense",
            &[initial.numel()],
            dense_params(config.z_dim, initial.numel()),
            0,
        );

        let fc_bn = momentum.map(|m| {
            summary.push_batch_norm("generator_dense_bn", &[initial.numel()], initial.numel());
            nn::batch_norm1d(vs / "generator_dense_bn", initial.numel(), batch_norm_config(m))
        });
        summary.push("activation_dense", activation.name(), &[initial.numel()]);
        summary.push("reshape", "Reshape", &initial.dims());
        if enabled(config.dropout_rate).is_some() {
            summary.push("dropout", "Dropout", &initial.dims());
        }

        let n_layers = config.conv_filters.len();
        let mut layers = Vec::with_capacity(n_layers);
        let mut batch_norms = Vec::with_capacity(n_layers);
        let mut shape = initial;

        for i in 0..n_layers {
            let filters = config.conv_filters[i];
            let kernel = config.conv_kernel_size[i];
            let name = format!("generator_conv_{}", i);

            let (layer, out_shape) = if config.upsample[i] == 2 {
                let up_shape = ImageShape::new(shape.channels, shape.height * 2, shape.width * 2);
                summary.push(&format!("up_sampling_{}", i), "UpSampling2D", &up_shape.dims());

                let conv = SameConv2d::new(
                    vs / name.as_str(),
                    shape.channels,
                    filters,
                    kernel,
                    1,
                    Some(init),
                );
                summary.push_params(
                    &name,
                    "Conv2D",
                    &[filters, up_shape.height, up_shape.width],
                    conv_params(shape.channels, filters, kernel),
                    0,
                );
                (
                    GrowLayer::Upsample(conv),
                    ImageShape::new(filters, up_shape.height, up_shape.width),
                )
            } else {
                let stride = config.conv_strides[i];
                let conv = SameConvTranspose2d::new(
                    vs / name.as_str(),
                    shape.channels,
                    filters,
                    kernel,
                    stride,
                    Some(init),
                );
                let out = ImageShape::new(filters, shape.height * stride, shape.width * stride);
                summary.push_params(
                    &name,
                    "Conv2DTranspose",
                    &out.dims(),
                    conv_params(shape.channels, filters, kernel),
                    0,
                );
                (GrowLayer::Transpose(conv), out)
            };

            let bn = if i < n_layers - 1 {
                let bn = momentum.map(|m| {
                    let bn_name = format!("generator_bn_{}", i);
                    summary.push_batch_norm(&bn_name, &out_shape.dims(), filters);
                    nn::batch_norm2d(vs / bn_name.as_str(), filters, batch_norm_config(m))
                });
                summary.push(
                    &format!("activation_{}", i),
                    activation.name(),
                    &out_shape.dims(),
                );
                bn
            } else {
                summary.push("tanh", "Activation", &out_shape.dims());
                None
            };

            layers.push(layer);
            batch_norms.push(bn);
            shape = out_shape;
        }

        Ok(Self {
            config,
            fc,
            fc_bn,
            layers,
            batch_norms,
            activation,
            summary,
        })
    }

    /// Generate images from noise
    ///
    /// # Arguments
    ///
    /// * `noise` - Tensor of shape (batch_size, z_dim)
    /// * `train` - Whether in training mode (affects batch norm and dropout)
    ///
    /// # Returns
    ///
    /// Tensor of shape (batch_size, channels, height, width) in [-1, 1]
    pub fn forward_t(&self, noise: &Tensor, train: bool) -> Tensor {
        self.forward_with(noise, train, train)
    }

    /// Forward pass while the critic trains: batch norm uses its running
    /// statistics, dropout stays active
    pub fn forward_frozen(&self, noise: &Tensor) -> Tensor {
        self.forward_with(noise, false, true)
    }

    fn forward_with(&self, noise: &Tensor, bn_train: bool, dropout_train: bool) -> Tensor {
        let s = self.config.initial_dense_layer_size;

        let mut x = self.fc.forward(noise);
        if let Some(bn) = &self.fc_bn {
            x = bn.forward_t(&x, bn_train);
        }
        x = self.activation.apply(&x);
        x = x.view([-1, s.channels, s.height, s.width]);
        if let Some(rate) = enabled(self.config.dropout_rate) {
            x = x.dropout(rate, dropout_train);
        }

        let last = self.layers.len() - 1;
        for (i, (layer, bn)) in self.layers.iter().zip(&self.batch_norms).enumerate() {
            x = layer.forward(&x);
            if i < last {
                if let Some(bn) = bn {
                    x = bn.forward_t(&x, bn_train);
                }
                x = self.activation.apply(&x);
            } else {
                x = x.tanh();
            }
        }
        x
    }

    /// Generate images (inference mode)
    pub fn generate(&self, noise: &Tensor) -> Tensor {
        tch::no_grad(|| self.forward_t(noise, false))
    }

    /// Generate images from fresh N(0, 1) noise
    pub fn generate_random(&self, num_samples: i64, device: Device) -> Tensor {
        let noise = Tensor::randn([num_samples, self.config.z_dim], (Kind::Float, device));
        self.generate(&noise)
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }
}

impl ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        Generator::forward_t(self, xs, train)
    }
}
