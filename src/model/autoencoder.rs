//! Convolutional autoencoder
//!
//! The encoder downsamples an image through a stack of "same" convolutions
//! into a dense bottleneck of size `z_dim`; the decoder mirrors it with
//! transposed convolutions and ends with a sigmoid so reconstructions live
//! in [0, 1].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, nn::ModuleT, nn::OptimizerConfig, nn::VarStore, Device, Tensor};
use tracing::info;

use super::layers::{
    conv_params, dense_params, leaky_relu, same_conv_output, ImageShape, ModelSummary,
    SameConv2d, SameConvTranspose2d,
};
use crate::training::{AutoencoderMetrics, AutoencoderTrainer, AutoencoderTrainingConfig};
use crate::utils::checkpoint::{create_run_folder, load_params, save_params};

/// Negative slope of the LeakyReLU layers in both halves
const LEAKY_SLOPE: f64 = 0.3;
/// Dropout rate used when `use_dropout` is set
const DROPOUT_RATE: f64 = 0.25;
/// Running statistics decay, expressed as libtorch momentum (1 - 0.99)
const BATCH_NORM_MOMENTUM: f64 = 0.01;
const BATCH_NORM_EPS: f64 = 1e-3;

/// Autoencoder architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoencoderConfig {
    /// Input image shape
    pub input_dim: ImageShape,
    pub encoder_conv_filters: Vec<i64>,
    pub encoder_conv_kernel_size: Vec<i64>,
    pub encoder_conv_strides: Vec<i64>,
    pub decoder_conv_t_filters: Vec<i64>,
    pub decoder_conv_t_kernel_size: Vec<i64>,
    pub decoder_conv_t_strides: Vec<i64>,
    /// Size of the latent bottleneck
    pub z_dim: i64,
    #[serde(default)]
    pub use_batch_norm: bool,
    #[serde(default)]
    pub use_dropout: bool,
}

impl Default for AutoencoderConfig {
    /// MNIST set-up: 28x28 greyscale into a 2-dimensional latent space
    fn default() -> Self {
        Self {
            input_dim: ImageShape::new(1, 28, 28),
            encoder_conv_filters: vec![32, 64, 64, 64],
            encoder_conv_kernel_size: vec![3, 3, 3, 3],
            encoder_conv_strides: vec![1, 2, 2, 1],
            decoder_conv_t_filters: vec![64, 64, 32, 1],
            decoder_conv_t_kernel_size: vec![3, 3, 3, 3],
            decoder_conv_t_strides: vec![1, 2, 2, 1],
            z_dim: 2,
            use_batch_norm: false,
            use_dropout: false,
        }
    }
}

impl AutoencoderConfig {
    pub fn n_layers_encoder(&self) -> usize {
        self.encoder_conv_filters.len()
    }

    pub fn n_layers_decoder(&self) -> usize {
        self.decoder_conv_t_filters.len()
    }

    /// Feature map shape at the end of the convolutional encoder
    pub fn shape_before_flattening(&self) -> ImageShape {
        let mut shape = self.input_dim;
        for (&filters, &stride) in self
            .encoder_conv_filters
            .iter()
            .zip(&self.encoder_conv_strides)
        {
            shape = ImageShape::new(
                filters,
                same_conv_output(shape.height, stride),
                same_conv_output(shape.width, stride),
            );
        }
        shape
    }

    /// Shape produced by the decoder
    pub fn decoder_output_shape(&self) -> ImageShape {
        let mut shape = self.shape_before_flattening();
        for (&filters, &stride) in self
            .decoder_conv_t_filters
            .iter()
            .zip(&self.decoder_conv_t_strides)
        {
            shape = ImageShape::new(filters, shape.height * stride, shape.width * stride);
        }
        shape
    }

    /// Check the configuration before any layer is built
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.encoder_conv_filters.len() == self.encoder_conv_kernel_size.len()
            && self.encoder_conv_kernel_size.len() == self.encoder_conv_strides.len())
        {
            anyhow::bail!(
                "Encoder filter sizes, kernel sizes, and strides must have the same length."
            );
        }
        if !(self.decoder_conv_t_filters.len() == self.decoder_conv_t_kernel_size.len()
            && self.decoder_conv_t_kernel_size.len() == self.decoder_conv_t_strides.len())
        {
            anyhow::bail!(
                "Decoder filter sizes, kernel sizes, and strides must have the same length."
            );
        }
        if self.encoder_conv_filters.is_empty() || self.decoder_conv_t_filters.is_empty() {
            anyhow::bail!("Encoder and decoder need at least one convolutional layer");
        }
        if !self.input_dim.is_valid() {
            anyhow::bail!("Invalid input shape {}", self.input_dim);
        }
        if self.z_dim <= 0 {
            anyhow::bail!("Latent dimension must be > 0");
        }

        let mut sizes = self
            .encoder_conv_filters
            .iter()
            .chain(&self.encoder_conv_kernel_size)
            .chain(&self.encoder_conv_strides)
            .chain(&self.decoder_conv_t_filters)
            .chain(&self.decoder_conv_t_kernel_size)
            .chain(&self.decoder_conv_t_strides);
        if sizes.any(|&v| v <= 0) {
            anyhow::bail!("Filters, kernel sizes and strides must all be > 0");
        }

        let output = self.decoder_output_shape();
        if output != self.input_dim {
            anyhow::bail!(
                "Decoder output shape {} does not match input shape {}",
                output,
                self.input_dim
            );
        }
        Ok(())
    }
}

/// Convolution followed by the optional batch norm of one block
#[derive(Debug)]
struct ConvBlock<C> {
    conv: C,
    batch_norm: Option<nn::BatchNorm>,
}

fn build_batch_norm(vs: nn::Path, channels: i64) -> nn::BatchNorm {
    nn::batch_norm2d(
        vs,
        channels,
        nn::BatchNormConfig {
            momentum: BATCH_NORM_MOMENTUM,
            eps: BATCH_NORM_EPS,
            ..Default::default()
        },
    )
}

/// Encoder half: image -> latent vector
#[derive(Debug)]
pub struct Encoder {
    blocks: Vec<ConvBlock<SameConv2d>>,
    output: nn::Linear,
    use_dropout: bool,
    shape_before_flattening: ImageShape,
    summary: ModelSummary,
}

impl Encoder {
    pub fn new(vs: &nn::Path, config: &AutoencoderConfig) -> Self {
        let mut summary = ModelSummary::new("encoder");
        summary.push("encoder_input", "InputLayer", &config.input_dim.dims());

        let mut blocks = Vec::with_capacity(config.n_layers_encoder());
        let mut shape = config.input_dim;

        for i in 0..config.n_layers_encoder() {
            let filters = config.encoder_conv_filters[i];
            let kernel = config.encoder_conv_kernel_size[i];
            let stride = config.encoder_conv_strides[i];
            let name = format!("encoder_conv_{}", i);

            let conv = SameConv2d::new(
                vs / name.as_str(),
                shape.channels,
                filters,
                kernel,
                stride,
                None,
            );
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
            summary.push(&format!("leaky_re_lu_{}", i), "LeakyReLU", &out_shape.dims());

            let batch_norm = if config.use_batch_norm {
                let bn_name = format!("encoder_bn_{}", i);
                summary.push_batch_norm(&bn_name, &out_shape.dims(), filters);
                Some(build_batch_norm(vs / bn_name.as_str(), filters))
            } else {
                None
            };
            if config.use_dropout {
                summary.push(&format!("dropout_{}", i), "Dropout", &out_shape.dims());
            }

            blocks.push(ConvBlock { conv, batch_norm });
            shape = out_shape;
        }

        summary.push("flatten", "Flatten", &[shape.numel()]);
        let output = nn::linear(
            vs / "encoder_output",
            shape.numel(),
            config.z_dim,
            Default::default(),
        );
        summary.push_params(
            "encoder_output",
            "Dense",
            &[config.z_dim],
            dense_params(shape.numel(), config.z_dim),
            0,
        );

        Self {
            blocks,
            output,
            use_dropout: config.use_dropout,
            shape_before_flattening: shape,
            summary,
        }
    }

    pub fn shape_before_flattening(&self) -> ImageShape {
        self.shape_before_flattening
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }
}

impl ModuleT for Encoder {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = xs.shallow_clone();

        for block in &self.blocks {
            x = block.conv.forward(&x);
            x = leaky_relu(&x, LEAKY_SLOPE);
            if let Some(bn) = &block.batch_norm {
                x = bn.forward_t(&x, train);
            }
            if self.use_dropout {
                x = x.dropout(DROPOUT_RATE, train);
            }
        }

        self.output.forward(&x.flatten(1, -1))
    }
}

/// Decoder half: latent vector -> image
#[derive(Debug)]
pub struct Decoder {
    input: nn::Linear,
    blocks: Vec<ConvBlock<SameConvTranspose2d>>,
    use_dropout: bool,
    shape_before_flattening: ImageShape,
    summary: ModelSummary,
}

impl Decoder {
    pub fn new(vs: &nn::Path, config: &AutoencoderConfig, shape_before_flattening: ImageShape) -> Self {
        let mut summary = ModelSummary::new("decoder");
        summary.push("decoder_input", "InputLayer", &[config.z_dim]);

        let input = nn::linear(
            vs / "decoder_dense",
            config.z_dim,
            shape_before_flattening.numel(),
            Default::default(),
        );
        summary.push_params(
            "decoder_dense",
            "Dense",
            &[shape_before_flattening.numel()],
            dense_params(config.z_dim, shape_before_flattening.numel()),
            0,
        );
        summary.push("reshape", "Reshape", &shape_before_flattening.dims());

        let n_layers = config.n_layers_decoder();
        // Layer names continue the encoder's numbering
        let offset = config.n_layers_encoder();
        let mut blocks = Vec::with_capacity(n_layers);
        let mut shape = shape_before_flattening;

        for i in 0..n_layers {
            let filters = config.decoder_conv_t_filters[i];
            let kernel = config.decoder_conv_t_kernel_size[i];
            let stride = config.decoder_conv_t_strides[i];
            let name = format!("decoder_conv_t_{}", i);

            let conv = SameConvTranspose2d::new(
                vs / name.as_str(),
                shape.channels,
                filters,
                kernel,
                stride,
                None,
            );
            let out_shape =
                ImageShape::new(filters, shape.height * stride, shape.width * stride);
            summary.push_params(
                &name,
                "Conv2DTranspose",
                &out_shape.dims(),
                conv_params(shape.channels, filters, kernel),
                0,
            );

            let last = i == n_layers - 1;
            let batch_norm = if !last {
                summary.push(
                    &format!("leaky_re_lu_{}", offset + i),
                    "LeakyReLU",
                    &out_shape.dims(),
                );
                if config.use_batch_norm {
                    let bn_name = format!("decoder_bn_{}", i);
                    summary.push_batch_norm(&bn_name, &out_shape.dims(), filters);
                    Some(build_batch_norm(vs / bn_name.as_str(), filters))
                } else {
                    None
                }
            } else {
                summary.push("sigmoid", "Activation", &out_shape.dims());
                None
            };
            if !last && config.use_dropout {
                summary.push(&format!("dropout_{}", offset + i), "Dropout", &out_shape.dims());
            }

            blocks.push(ConvBlock { conv, batch_norm });
            shape = out_shape;
        }

        Self {
            input,
            blocks,
            use_dropout: config.use_dropout,
            shape_before_flattening,
            summary,
        }
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }
}

impl ModuleT for Decoder {
    fn forward_t(&self, zs: &Tensor, train: bool) -> Tensor {
        let s = self.shape_before_flattening;
        let mut x = self
            .input
            .forward(zs)
            .view([-1, s.channels, s.height, s.width]);

        let last = self.blocks.len() - 1;
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.conv.forward(&x);

            if i < last {
                x = leaky_relu(&x, LEAKY_SLOPE);
                if let Some(bn) = &block.batch_norm {
                    x = bn.forward_t(&x, train);
                }
                if self.use_dropout {
                    x = x.dropout(DROPOUT_RATE, train);
                }
            } else {
                x = x.sigmoid();
            }
        }
        x
    }
}

/// Encoder and decoder composed into one trainable model
pub struct Autoencoder {
    /// Encoder network
    pub encoder: Encoder,
    /// Decoder network
    pub decoder: Decoder,
    /// Variables of both halves
    pub vs: VarStore,
    pub device: Device,
    config: AutoencoderConfig,
    optimizer: Option<nn::Optimizer>,
    learning_rate: Option<f64>,
    summary: ModelSummary,
}

impl Autoencoder {
    /// Build encoder, decoder and the full model
    pub fn new(config: AutoencoderConfig, device: Device) -> anyhow::Result<Self> {
        config.validate()?;

        let vs = VarStore::new(device);
        let root = vs.root();
        let encoder = Encoder::new(&(&root / "encoder"), &config);
        let decoder = Decoder::new(
            &(&root / "decoder"),
            &config,
            encoder.shape_before_flattening(),
        );

        let mut summary = ModelSummary::new("autoencoder");
        summary.push("encoder_input", "InputLayer", &config.input_dim.dims());
        for layer in encoder.summary().layers.iter().skip(1) {
            summary.layers.push(layer.clone());
        }
        summary.push_model(decoder.summary());

        let model = Self {
            encoder,
            decoder,
            vs,
            device,
            config,
            optimizer: None,
            learning_rate: None,
            summary,
        };

        info!("Autoencoder model summary:");
        model.summary.log();

        Ok(model)
    }

    /// Rebuild a model from the `params.json` in a run folder
    pub fn load<P: AsRef<Path>>(folder: P, device: Device) -> anyhow::Result<Self> {
        let config: AutoencoderConfig = load_params(folder.as_ref())?;
        Self::new(config, device)
    }

    /// Attach an Adam optimizer at the given learning rate
    pub fn compile(&mut self, learning_rate: f64) -> anyhow::Result<()> {
        let optimizer = nn::Adam::default().build(&self.vs, learning_rate)?;
        self.optimizer = Some(optimizer);
        self.learning_rate = Some(learning_rate);
        Ok(())
    }

    /// Learning rate passed to `compile`, if any
    pub fn learning_rate(&self) -> Option<f64> {
        self.learning_rate
    }

    /// Change the optimizer learning rate (used by the schedule)
    pub fn set_learning_rate(&mut self, lr: f64) -> anyhow::Result<()> {
        self.compiled_optimizer()?.set_lr(lr);
        Ok(())
    }

    /// Zero gradients, backpropagate `loss` and update all weights
    pub fn backward_step(&mut self, loss: &Tensor) -> anyhow::Result<()> {
        self.compiled_optimizer()?.backward_step(loss);
        Ok(())
    }

    fn compiled_optimizer(&mut self) -> anyhow::Result<&mut nn::Optimizer> {
        self.optimizer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Model must be compiled before training"))
    }

    /// Full reconstruction pass
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let z = self.encoder.forward_t(xs, train);
        self.decoder.forward_t(&z, train)
    }

    /// Latent codes for a batch of images (inference mode)
    pub fn encode(&self, xs: &Tensor) -> Tensor {
        tch::no_grad(|| self.encoder.forward_t(xs, false))
    }

    /// Images for a batch of latent codes (inference mode)
    pub fn decode(&self, zs: &Tensor) -> Tensor {
        tch::no_grad(|| self.decoder.forward_t(zs, false))
    }

    /// Reconstructions of a batch of images (inference mode)
    pub fn reconstruct(&self, xs: &Tensor) -> Tensor {
        tch::no_grad(|| self.forward_t(xs, false))
    }

    /// Fit the model to reconstruct `x_train`
    pub fn train(
        &mut self,
        x_train: &Tensor,
        config: AutoencoderTrainingConfig,
    ) -> anyhow::Result<AutoencoderMetrics> {
        let mut trainer = AutoencoderTrainer::new(config, self.device);
        trainer.train(self, x_train)?;
        Ok(trainer.metrics().clone())
    }

    /// Write the run folder skeleton, `params.json` and architecture files
    pub fn save<P: AsRef<Path>>(&self, folder: P) -> anyhow::Result<()> {
        let folder = folder.as_ref();
        create_run_folder(folder)?;
        save_params(folder, &self.config)?;
        self.plot_model(folder)
    }

    /// Write the textual architecture of model, encoder and decoder to `viz/`
    pub fn plot_model<P: AsRef<Path>>(&self, run_folder: P) -> anyhow::Result<()> {
        let viz = run_folder.as_ref().join("viz");
        std::fs::create_dir_all(&viz)?;
        self.summary.save(viz.join("model.txt"))?;
        self.encoder.summary().save(viz.join("encoder.txt"))?;
        self.decoder.summary().save(viz.join("decoder.txt"))?;
        Ok(())
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.vs.save(path)?;
        Ok(())
    }

    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        info!("Model summary before loading weights:");
        self.summary.log();

        self.vs.load(path.as_ref())?;

        info!("Model summary after loading weights:");
        self.summary.log();
        Ok(())
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }

    pub fn z_dim(&self) -> i64 {
        self.config.z_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn small_config() -> AutoencoderConfig {
        AutoencoderConfig {
            input_dim: ImageShape::new(1, 8, 8),
            encoder_conv_filters: vec![4, 8],
            encoder_conv_kernel_size: vec![3, 3],
            encoder_conv_strides: vec![1, 2],
            decoder_conv_t_filters: vec![4, 1],
            decoder_conv_t_kernel_size: vec![3, 3],
            decoder_conv_t_strides: vec![2, 1],
            z_dim: 3,
            use_batch_norm: false,
            use_dropout: false,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AutoencoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shape_before_flattening(), ImageShape::new(64, 7, 7));
    }

    #[test]
    fn test_mismatched_encoder_lists_rejected() {
        let mut config = small_config();
        config.encoder_conv_strides.push(1);

        let err = Autoencoder::new(config, Device::Cpu).err().unwrap();
        assert!(err.to_string().contains("Encoder filter sizes"));
    }

    #[test]
    fn test_mismatched_decoder_lists_rejected() {
        let mut config = small_config();
        config.decoder_conv_t_kernel_size.pop();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Decoder filter sizes"));
    }

    #[test]
    fn test_decoder_shape_must_match_input() {
        let mut config = small_config();
        config.decoder_conv_t_strides = vec![1, 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shapes_through_the_model() {
        let model = Autoencoder::new(small_config(), Device::Cpu).unwrap();
        let xs = Tensor::rand([5, 1, 8, 8], (Kind::Float, Device::Cpu));

        let z = model.encode(&xs);
        assert_eq!(z.size(), vec![5, 3]);

        let decoded = model.decode(&z);
        assert_eq!(decoded.size(), vec![5, 1, 8, 8]);

        let recon = model.reconstruct(&xs);
        assert_eq!(recon.size(), vec![5, 1, 8, 8]);

        // Sigmoid output stays in [0, 1]
        assert!(recon.min().double_value(&[]) >= 0.0);
        assert!(recon.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn test_batch_norm_and_dropout_variant() {
        let mut config = small_config();
        config.use_batch_norm = true;
        config.use_dropout = true;

        let model = Autoencoder::new(config, Device::Cpu).unwrap();
        let xs = Tensor::rand([4, 1, 8, 8], (Kind::Float, Device::Cpu));
        let ys = model.forward_t(&xs, true);
        assert_eq!(ys.size(), vec![4, 1, 8, 8]);
    }

    #[test]
    fn test_summary_matches_variable_store() {
        let mut config = small_config();
        config.use_batch_norm = true;
        let model = Autoencoder::new(config, Device::Cpu).unwrap();

        let trainable: i64 = model
            .vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel() as i64)
            .sum();
        assert_eq!(model.summary().trainable_params(), trainable);
    }

    #[test]
    fn test_summary_layer_names_are_unique() {
        let mut config = small_config();
        config.use_dropout = true;
        let model = Autoencoder::new(config, Device::Cpu).unwrap();

        let mut names: Vec<&str> = model
            .encoder
            .summary()
            .layers
            .iter()
            .chain(&model.decoder.summary().layers)
            .map(|l| l.name.as_str())
            .collect();
        assert!(names.contains(&"leaky_re_lu_2"));
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_train_requires_compile() {
        let mut model = Autoencoder::new(small_config(), Device::Cpu).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let xs = Tensor::rand([4, 1, 8, 8], (Kind::Float, Device::Cpu));

        let config = AutoencoderTrainingConfig {
            batch_size: 2,
            epochs: 1,
            run_folder: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(model.train(&xs, config).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let model = Autoencoder::new(small_config(), Device::Cpu).unwrap();
        model.save(dir.path()).unwrap();

        assert!(dir.path().join("params.json").exists());
        assert!(dir.path().join("viz/encoder.txt").exists());
        assert!(dir.path().join("weights").is_dir());
        assert!(dir.path().join("images").is_dir());

        let weights = dir.path().join("weights/weights.ot");
        model.save_weights(&weights).unwrap();

        let mut restored = Autoencoder::load(dir.path(), Device::Cpu).unwrap();
        assert_eq!(restored.config(), model.config());
        restored.load_weights(&weights).unwrap();

        let xs = Tensor::rand([2, 1, 8, 8], (Kind::Float, Device::Cpu));
        let a = model.reconstruct(&xs);
        let b = restored.reconstruct(&xs);
        assert!(a.allclose(&b, 1e-5, 1e-6, false));
    }
}
