//! Shared layer plumbing for the convolutional models
//!
//! libtorch only offers symmetric padding, so "same" convolutions are built
//! here from an explicit zero-pad (or crop, for the transposed case) around
//! an unpadded convolution. The output size then matches `ceil(len / stride)`
//! for convolutions and `len * stride` for transposed convolutions.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Tensor};
use tracing::info;

/// Shape of a single image in NCHW order (batch dimension excluded)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: i64,
    pub height: i64,
    pub width: i64,
}

impl ImageShape {
    pub fn new(channels: i64, height: i64, width: i64) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Number of scalars in one image
    pub fn numel(&self) -> i64 {
        self.channels * self.height * self.width
    }

    pub fn dims(&self) -> [i64; 3] {
        [self.channels, self.height, self.width]
    }

    /// Full tensor shape for a batch of `batch` images
    pub fn with_batch(&self, batch: i64) -> [i64; 4] {
        [batch, self.channels, self.height, self.width]
    }

    pub fn is_valid(&self) -> bool {
        self.channels > 0 && self.height > 0 && self.width > 0
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.channels, self.height, self.width)
    }
}

/// Output length of a "same" padded convolution
pub fn same_conv_output(len: i64, stride: i64) -> i64 {
    (len + stride - 1) / stride
}

/// Padding (before, after) for a "same" convolution along one axis
///
/// When the total padding is odd the extra pixel goes after.
pub fn same_padding(len: i64, kernel: i64, stride: i64) -> (i64, i64) {
    let out = same_conv_output(len, stride);
    let total = ((out - 1) * stride + kernel - len).max(0);
    (total / 2, total - total / 2)
}

/// Weight initialisation N(mean, std)
pub fn normal_init(mean: f64, stdev: f64) -> nn::Init {
    nn::Init::Randn { mean, stdev }
}

/// 2D convolution with "same" padding
#[derive(Debug)]
pub struct SameConv2d {
    conv: nn::Conv2D,
    kernel: i64,
    stride: i64,
}

impl SameConv2d {
    pub fn new<'a>(
        vs: nn::Path<'a>,
        in_channels: i64,
        out_channels: i64,
        kernel: i64,
        stride: i64,
        ws_init: Option<nn::Init>,
    ) -> Self {
        let mut config = nn::ConvConfig {
            stride,
            padding: 0,
            ..Default::default()
        };
        if let Some(init) = ws_init {
            config.ws_init = init;
        }

        let conv = nn::conv2d(vs, in_channels, out_channels, kernel, config);

        Self {
            conv,
            kernel,
            stride,
        }
    }
}

impl Module for SameConv2d {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (top, bottom) = same_padding(size[2], self.kernel, self.stride);
        let (left, right) = same_padding(size[3], self.kernel, self.stride);

        if top + bottom + left + right == 0 {
            return self.conv.forward(xs);
        }

        // Padding list runs from the last dimension backwards
        let padded = xs.constant_pad_nd([left, right, top, bottom]);
        self.conv.forward(&padded)
    }
}

/// Transposed 2D convolution with "same" padding (output = input * stride)
#[derive(Debug)]
pub struct SameConvTranspose2d {
    conv: nn::ConvTranspose2D,
    kernel: i64,
    stride: i64,
}

impl SameConvTranspose2d {
    pub fn new<'a>(
        vs: nn::Path<'a>,
        in_channels: i64,
        out_channels: i64,
        kernel: i64,
        stride: i64,
        ws_init: Option<nn::Init>,
    ) -> Self {
        let mut config = nn::ConvTransposeConfig {
            stride,
            padding: 0,
            output_padding: (stride - kernel).max(0),
            ..Default::default()
        };
        if let Some(init) = ws_init {
            config.ws_init = init;
        }

        let conv = nn::conv_transpose2d(vs, in_channels, out_channels, kernel, config);

        Self {
            conv,
            kernel,
            stride,
        }
    }
}

impl Module for SameConvTranspose2d {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let out_h = size[2] * self.stride;
        let out_w = size[3] * self.stride;
        let crop = (self.kernel - self.stride).max(0) / 2;

        self.conv
            .forward(xs)
            .narrow(2, crop, out_h)
            .narrow(3, crop, out_w)
    }
}

/// Nearest-neighbour 2x upsampling of an NCHW tensor
pub fn upsample_nearest2x(xs: &Tensor) -> Tensor {
    let size = xs.size();
    let (n, c, h, w) = (size[0], size[1], size[2], size[3]);

    xs.view([n, c, h, 1, w, 1])
        .expand([n, c, h, 2, w, 2], false)
        .reshape([n, c, h * 2, w * 2])
}

/// Leaky ReLU with an arbitrary negative slope (slope < 1)
pub fn leaky_relu(xs: &Tensor, slope: f64) -> Tensor {
    xs.maximum(&(xs * slope))
}

/// Activation functions selectable by name in the model configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// Leaky ReLU with the given negative slope
    LeakyRelu(f64),
    Relu,
    Tanh,
    Sigmoid,
    Elu,
    Linear,
}

impl Activation {
    /// Slope used when `leaky_relu` is selected by name
    pub const LEAKY_SLOPE: f64 = 0.2;

    pub fn apply(&self, xs: &Tensor) -> Tensor {
        match self {
            Activation::LeakyRelu(slope) => leaky_relu(xs, *slope),
            Activation::Relu => xs.relu(),
            Activation::Tanh => xs.tanh(),
            Activation::Sigmoid => xs.sigmoid(),
            Activation::Elu => xs.elu(),
            Activation::Linear => xs.shallow_clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::LeakyRelu(_) => "leaky_relu",
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Elu => "elu",
            Activation::Linear => "linear",
        }
    }
}

impl FromStr for Activation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leaky_relu" => Ok(Activation::LeakyRelu(Self::LEAKY_SLOPE)),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "elu" => Ok(Activation::Elu),
            "linear" => Ok(Activation::Linear),
            other => anyhow::bail!("Unknown activation '{}'", other),
        }
    }
}

/// Parameter count of a convolution (weights + bias)
pub fn conv_params(in_channels: i64, out_channels: i64, kernel: i64) -> i64 {
    kernel * kernel * in_channels * out_channels + out_channels
}

/// Parameter count of a dense layer (weights + bias)
pub fn dense_params(in_features: i64, out_features: i64) -> i64 {
    in_features * out_features + out_features
}

/// One row of a model summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSummary {
    pub name: String,
    pub kind: String,
    /// Output shape without the batch dimension
    pub output_shape: Vec<i64>,
    pub trainable_params: i64,
    pub non_trainable_params: i64,
}

/// Layer-by-layer description of a model
///
/// Built alongside the network so it can be logged and written to the
/// run folder without tracing a forward pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub layers: Vec<LayerSummary>,
}

impl ModelSummary {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            layers: Vec::new(),
        }
    }

    /// Record a layer without parameters
    pub fn push(&mut self, name: &str, kind: &str, output_shape: &[i64]) {
        self.push_params(name, kind, output_shape, 0, 0);
    }

    pub fn push_params(
        &mut self,
        name: &str,
        kind: &str,
        output_shape: &[i64],
        trainable: i64,
        non_trainable: i64,
    ) {
        self.layers.push(LayerSummary {
            name: name.to_string(),
            kind: kind.to_string(),
            output_shape: output_shape.to_vec(),
            trainable_params: trainable,
            non_trainable_params: non_trainable,
        });
    }

    /// Record a batch norm layer over `channels` features
    pub fn push_batch_norm(&mut self, name: &str, output_shape: &[i64], channels: i64) {
        self.push_params(name, "BatchNormalization", output_shape, 2 * channels, 2 * channels);
    }

    /// Record a nested model as a single row
    pub fn push_model(&mut self, other: &ModelSummary) {
        let shape = other.output_shape().unwrap_or(&[]).to_vec();
        self.push_params(
            &other.name,
            "Model",
            &shape,
            other.trainable_params(),
            other.non_trainable_params(),
        );
    }

    pub fn output_shape(&self) -> Option<&[i64]> {
        self.layers.last().map(|l| l.output_shape.as_slice())
    }

    pub fn trainable_params(&self) -> i64 {
        self.layers.iter().map(|l| l.trainable_params).sum()
    }

    pub fn non_trainable_params(&self) -> i64 {
        self.layers.iter().map(|l| l.non_trainable_params).sum()
    }

    pub fn total_params(&self) -> i64 {
        self.trainable_params() + self.non_trainable_params()
    }

    /// Render as a plain-text table
    pub fn to_table(&self) -> String {
        let rule = "-".repeat(78);
        let mut out = String::new();

        out.push_str(&format!("Model: \"{}\"\n", self.name));
        out.push_str(&rule);
        out.push('\n');
        out.push_str(&format!(
            "{:<34}{:<28}{:>16}\n",
            "Layer (type)", "Output Shape", "Param #"
        ));
        out.push_str(&rule);
        out.push('\n');

        for layer in &self.layers {
            let shape = std::iter::once("None".to_string())
                .chain(layer.output_shape.iter().map(|d| d.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(
                "{:<34}{:<28}{:>16}\n",
                format!("{} ({})", layer.name, layer.kind),
                format!("({})", shape),
                layer.trainable_params + layer.non_trainable_params
            ));
        }

        out.push_str(&rule);
        out.push('\n');
        out.push_str(&format!("Total params: {}\n", self.total_params()));
        out.push_str(&format!("Trainable params: {}\n", self.trainable_params()));
        out.push_str(&format!(
            "Non-trainable params: {}\n",
            self.non_trainable_params()
        ));
        out
    }

    /// Log the table line by line
    pub fn log(&self) {
        for line in self.to_table().lines() {
            info!("{}", line);
        }
    }

    /// Write the table to a text file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        std::fs::write(path, self.to_table())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device, Kind};

    #[test]
    fn test_same_padding_matches_ceil_division() {
        assert_eq!(same_conv_output(28, 1), 28);
        assert_eq!(same_conv_output(28, 2), 14);
        assert_eq!(same_conv_output(7, 2), 4);

        assert_eq!(same_padding(28, 3, 1), (1, 1));
        // Asymmetric: the extra pixel goes after
        assert_eq!(same_padding(28, 3, 2), (0, 1));
        assert_eq!(same_padding(64, 5, 2), (1, 2));
        assert_eq!(same_padding(7, 1, 1), (0, 0));
    }

    #[test]
    fn test_same_conv_output_shapes() {
        let vs = VarStore::new(Device::Cpu);
        let xs = Tensor::randn([2, 3, 7, 9], (Kind::Float, Device::Cpu));

        for (kernel, stride) in [(3, 1), (3, 2), (4, 2), (5, 2), (1, 1), (2, 3)] {
            let name = format!("conv_{}_{}", kernel, stride);
            let conv = SameConv2d::new(vs.root() / name.as_str(), 3, 4, kernel, stride, None);
            let ys = conv.forward(&xs);
            assert_eq!(
                ys.size(),
                vec![2, 4, same_conv_output(7, stride), same_conv_output(9, stride)]
            );
        }
    }

    #[test]
    fn test_same_conv_transpose_output_shapes() {
        let vs = VarStore::new(Device::Cpu);
        let xs = Tensor::randn([2, 3, 7, 5], (Kind::Float, Device::Cpu));

        for (kernel, stride) in [(3, 1), (3, 2), (4, 2), (5, 2), (1, 2), (2, 3)] {
            let name = format!("conv_t_{}_{}", kernel, stride);
            let conv =
                SameConvTranspose2d::new(vs.root() / name.as_str(), 3, 2, kernel, stride, None);
            let ys = conv.forward(&xs);
            assert_eq!(ys.size(), vec![2, 2, 7 * stride, 5 * stride]);
        }
    }

    #[test]
    fn test_upsample_nearest2x_repeats_pixels() {
        let xs = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).view([1, 1, 2, 2]);
        let ys = upsample_nearest2x(&xs);

        assert_eq!(ys.size(), vec![1, 1, 4, 4]);
        let expected = Tensor::from_slice(&[
            1.0f32, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0,
        ])
        .view([1, 1, 4, 4]);
        assert!(ys.allclose(&expected, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_activation_parsing() {
        assert_eq!(
            "leaky_relu".parse::<Activation>().unwrap(),
            Activation::LeakyRelu(0.2)
        );
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("linear".parse::<Activation>().unwrap(), Activation::Linear);
        assert!("swish".parse::<Activation>().is_err());
    }

    #[test]
    fn test_leaky_relu_slope() {
        let xs = Tensor::from_slice(&[-10.0f32, 0.0, 5.0]);
        let ys = leaky_relu(&xs, 0.2);
        let values: Vec<f32> = Vec::<f32>::try_from(&ys).unwrap();
        assert_eq!(values, vec![-2.0, 0.0, 5.0]);
    }

    #[test]
    fn test_summary_totals() {
        let mut summary = ModelSummary::new("toy");
        summary.push("input", "InputLayer", &[1, 4, 4]);
        summary.push_params("conv", "Conv2D", &[8, 4, 4], conv_params(1, 8, 3), 0);
        summary.push_batch_norm("bn", &[8, 4, 4], 8);

        assert_eq!(summary.trainable_params(), 80 + 16);
        assert_eq!(summary.non_trainable_params(), 16);
        assert_eq!(summary.output_shape(), Some([8i64, 4, 4].as_slice()));
        assert!(summary.to_table().contains("Total params: 112"));
    }
}
