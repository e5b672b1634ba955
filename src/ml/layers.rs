//! アーキテクチャ間で共有する層

use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation, backend::Backend, Tensor},
};

use super::onnx::{fold_batch_norm, BatchNormParams, ConvSpec, GraphBuilder, HostTensor};
use crate::error::{Error, Result};

/// パラメータ名と形状の一覧（重み読み込み前後の比較用）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamShapes(Vec<(String, Vec<usize>)>);

impl ParamShapes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, dims: Vec<usize>) {
        self.0.push((name.into(), dims));
    }

    pub fn push_param<B: Backend, const D: usize>(&mut self, name: impl Into<String>, param: &Param<Tensor<B, D>>) {
        self.push(name, param.val().dims().to_vec());
    }

    pub fn entries(&self) -> &[(String, Vec<usize>)] {
        &self.0
    }

    /// 総パラメータ数
    pub fn num_params(&self) -> usize {
        self.0.iter().map(|(_, dims)| dims.iter().product::<usize>()).sum()
    }

    /// `actual` が同じ名前・形状を持つか確認
    pub fn check_against(&self, actual: &ParamShapes) -> Result<()> {
        for ((name, expected), (_, found)) in self.0.iter().zip(actual.0.iter()) {
            if expected != found {
                return Err(Error::ShapeMismatch {
                    name: name.clone(),
                    expected: expected.clone(),
                    actual: found.clone(),
                });
            }
        }
        if self.0.len() != actual.0.len() {
            return Err(Error::ShapeMismatch {
                name: "<parameter count>".to_string(),
                expected: vec![self.0.len()],
                actual: vec![actual.0.len()],
            });
        }
        Ok(())
    }
}

pub(crate) fn conv_host<B: Backend>(conv: &Conv2d<B>) -> Result<(HostTensor, Option<HostTensor>)> {
    let weight = HostTensor::from_tensor(conv.weight.val())?;
    let bias = conv
        .bias
        .as_ref()
        .map(|b| HostTensor::from_tensor(b.val()))
        .transpose()?;
    Ok((weight, bias))
}

pub(crate) fn conv_shapes<B: Backend>(conv: &Conv2d<B>, prefix: &str, out: &mut ParamShapes) {
    out.push_param(format!("{prefix}.weight"), &conv.weight);
    if let Some(bias) = &conv.bias {
        out.push_param(format!("{prefix}.bias"), bias);
    }
}

/// 畳み込み + BatchNorm（バイアスなし）
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            kernel,
            stride,
            padding,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }

    fn spec(&self) -> ConvSpec {
        ConvSpec {
            kernel: self.kernel,
            stride: self.stride,
            padding: self.padding,
        }
    }

    pub fn collect_shapes(&self, prefix: &str, out: &mut ParamShapes) {
        conv_shapes(&self.conv, &format!("{prefix}.conv"), out);
        out.push_param(format!("{prefix}.bn.gamma"), &self.bn.gamma);
        out.push_param(format!("{prefix}.bn.beta"), &self.bn.beta);
        out.push(format!("{prefix}.bn.running_mean"), self.bn.running_mean.value().dims().to_vec());
        out.push(format!("{prefix}.bn.running_var"), self.bn.running_var.value().dims().to_vec());
    }

    fn bn_params(&self) -> Result<BatchNormParams> {
        Ok(BatchNormParams {
            gamma: HostTensor::from_tensor(self.bn.gamma.val())?,
            beta: HostTensor::from_tensor(self.bn.beta.val())?,
            running_mean: HostTensor::from_tensor(self.bn.running_mean.value())?,
            running_var: HostTensor::from_tensor(self.bn.running_var.value())?,
            epsilon: self.bn.epsilon,
        })
    }

    /// ONNXに出力（定数畳み込み時はConv 1つ、それ以外はConv + BatchNormalization）
    pub fn emit(&self, graph: &mut GraphBuilder, prefix: &str, input: &str) -> Result<String> {
        let (weight, bias) = conv_host(&self.conv)?;
        let bn = self.bn_params()?;

        if graph.fold_constants() {
            let (weight, bias) = fold_batch_norm(&weight, bias.as_ref(), &bn)?;
            Ok(graph.conv(prefix, input, weight, Some(bias), self.spec()))
        } else {
            let x = graph.conv(&format!("{prefix}.conv"), input, weight, bias, self.spec());
            Ok(graph.batch_norm(&format!("{prefix}.bn"), &x, bn))
        }
    }
}

/// 二値分類ヘッド: Dropout -> Linear(in, 1) -> Sigmoid
#[derive(Module, Debug)]
pub struct BinaryHead<B: Backend> {
    dropout: Dropout,
    fc: Linear<B>,
}

impl<B: Backend> BinaryHead<B> {
    pub fn new(in_features: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            dropout: DropoutConfig::new(dropout).init(),
            fc: LinearConfig::new(in_features, 1).init(device),
        }
    }

    /// [batch, in_features] -> [batch, 1]（0〜1）
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(x);
        activation::sigmoid(self.fc.forward(x))
    }

    pub fn collect_shapes(&self, prefix: &str, out: &mut ParamShapes) {
        linear_shapes(&self.fc, &format!("{prefix}.fc"), out);
    }

    /// Dropoutは推論時に恒等写像なので出力しない
    pub fn emit(&self, graph: &mut GraphBuilder, prefix: &str, input: &str) -> Result<String> {
        let x = emit_linear(&self.fc, graph, &format!("{prefix}.fc"), input)?;
        Ok(graph.sigmoid(&x))
    }
}

pub(crate) fn linear_shapes<B: Backend>(linear: &Linear<B>, prefix: &str, out: &mut ParamShapes) {
    out.push_param(format!("{prefix}.weight"), &linear.weight);
    if let Some(bias) = &linear.bias {
        out.push_param(format!("{prefix}.bias"), bias);
    }
}

pub(crate) fn emit_linear<B: Backend>(
    linear: &Linear<B>,
    graph: &mut GraphBuilder,
    prefix: &str,
    input: &str,
) -> Result<String> {
    let weight = HostTensor::from_tensor(linear.weight.val())?;
    let bias = linear
        .bias
        .as_ref()
        .map(|b| HostTensor::from_tensor(b.val()))
        .transpose()?;
    Ok(graph.gemm(prefix, input, weight, bias))
}

/// [batch, c, h, w] -> [batch, c]（全体平均プーリング後の平坦化）
pub(crate) fn flatten_pooled<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch_size, channels, _, _] = x.dims();
    x.reshape([batch_size, channels])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_conv_bn_forward_shape() {
        let device = NdArrayDevice::Cpu;
        let layer = ConvBn::<TestBackend>::new(3, 8, 3, 2, 1, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        assert_eq!(layer.forward(x).dims(), [1, 8, 8, 8]);
    }

    #[test]
    fn test_conv_bn_shapes() {
        let device = NdArrayDevice::Cpu;
        let layer = ConvBn::<TestBackend>::new(3, 8, 3, 1, 1, &device);
        let mut shapes = ParamShapes::new();
        layer.collect_shapes("stem", &mut shapes);

        assert_eq!(shapes.entries()[0], ("stem.conv.weight".to_string(), vec![8, 3, 3, 3]));
        assert_eq!(shapes.entries().len(), 5);
        assert_eq!(shapes.num_params(), 8 * 27 + 4 * 8);
    }

    #[test]
    fn test_check_against_reports_first_difference() {
        let mut expected = ParamShapes::new();
        expected.push("a", vec![2, 2]);
        expected.push("b", vec![3]);
        let mut actual = ParamShapes::new();
        actual.push("a", vec![2, 2]);
        actual.push("b", vec![4]);

        let err = expected.check_against(&actual).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { ref name, .. } if name == "b"));
        assert!(expected.check_against(&expected.clone()).is_ok());
    }

    #[test]
    fn test_binary_head_range() {
        let device = NdArrayDevice::Cpu;
        let head = BinaryHead::<TestBackend>::new(4, 0.5, &device);
        let x = Tensor::<TestBackend, 2>::ones([2, 4], &device);
        let out = head.forward(x);
        assert_eq!(out.dims(), [2, 1]);
        for v in out.into_data().to_vec::<f32>().unwrap() {
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
