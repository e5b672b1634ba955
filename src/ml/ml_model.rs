//! 軽量CNNモデル
//!
//! 小さなデータセットや動作確認用の二値分類モデルです。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::layers::{conv_host, conv_shapes, emit_linear, flatten_pooled, linear_shapes, BinaryHead, ParamShapes};
use super::onnx::{ConvSpec, GraphBuilder};
use crate::error;

/// モデル設定
#[derive(Config, Debug)]
pub struct SimpleCnnConfig {
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

const CONV_SPEC: ConvSpec = ConvSpec {
    kernel: 3,
    stride: 1,
    padding: 0,
};

const POOL_SPEC: ConvSpec = ConvSpec {
    kernel: 2,
    stride: 2,
    padding: 0,
};

impl SimpleCnnConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> SimpleCnn<B> {
        SimpleCnn {
            // Conv1: 3x3 (no padding, stride 1)
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            // Conv2: 3x3 (no padding, stride 1)
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            // Conv3: 3x3 (no padding, stride 1)
            conv3: Conv2dConfig::new([64, 128], [3, 3]).init(device),
            gap: AdaptiveAvgPool2dConfig::new([1, 1]).init(),

            // 全結合層
            fc1: LinearConfig::new(128, 64).init(device),
            head: BinaryHead::new(64, self.dropout, device),

            activation: Relu::new(),
        }
    }
}

/// 二値分類用の軽量CNN
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 2層
/// - Conv 3x3 (no padding) + ReLU
/// - Global Average Pooling
/// - FC: 128 -> 64 + ReLU
/// - Dropout -> FC: 64 -> 1 -> Sigmoid
///
/// 全体平均プーリングを挟むので入力サイズに依存しません（最小14x14）。
#[derive(Module, Debug)]
pub struct SimpleCnn<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    gap: AdaptiveAvgPool2d,

    fc1: Linear<B>, // 128 -> 64
    head: BinaryHead<B>,

    activation: Relu,
}

impl<B: Backend> SimpleCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - シグモイド出力 [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.conv1.forward(images));
        let x = self.pool1.forward(x);

        let x = self.activation.forward(self.conv2.forward(x));
        let x = self.pool2.forward(x);

        let x = self.activation.forward(self.conv3.forward(x));
        let x = flatten_pooled(self.gap.forward(x));

        let x = self.activation.forward(self.fc1.forward(x));
        self.head.forward(x)
    }

    pub fn collect_shapes(&self, out: &mut ParamShapes) {
        conv_shapes(&self.conv1, "conv1", out);
        conv_shapes(&self.conv2, "conv2", out);
        conv_shapes(&self.conv3, "conv3", out);
        linear_shapes(&self.fc1, "fc1", out);
        self.head.collect_shapes("head", out);
    }

    pub fn emit_onnx(&self, graph: &mut GraphBuilder, input: &str) -> error::Result<String> {
        let mut x = input.to_string();
        for (name, conv, pooled) in [
            ("conv1", &self.conv1, true),
            ("conv2", &self.conv2, true),
            ("conv3", &self.conv3, false),
        ] {
            let (weight, bias) = conv_host(conv)?;
            x = graph.conv(name, &x, weight, bias, CONV_SPEC);
            x = graph.relu(&x);
            if pooled {
                x = graph.max_pool(&x, POOL_SPEC);
            }
        }

        let x = graph.global_average_pool(&x);
        let x = graph.flatten(&x);
        let x = emit_linear(&self.fc1, graph, "fc1", &x)?;
        let x = graph.relu(&x);
        self.head.emit(graph, "head", &x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_shape() {
        let device = NdArrayDevice::Cpu;
        let model = SimpleCnnConfig::new().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(model.forward(x).dims(), [2, 1]);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("simple_cnn.json");
        SimpleCnnConfig::new().with_dropout(0.25).save(&path).unwrap();

        let config = SimpleCnnConfig::load(&path).unwrap();
        assert_eq!(config.dropout, 0.25);
        assert_eq!(SimpleCnnConfig::new().dropout, 0.5);
    }

    #[test]
    fn test_emit_onnx_ops() {
        let device = NdArrayDevice::Cpu;
        let model = SimpleCnnConfig::new().init::<TestBackend>(&device);
        let mut graph = GraphBuilder::new(true);
        model.emit_onnx(&mut graph, "input").unwrap();

        let ops: Vec<&str> = graph.nodes().iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops.iter().filter(|op| **op == "Conv").count(), 3);
        assert_eq!(ops.last(), Some(&"Sigmoid"));
        // conv x3 (weight + bias), fc1, head.fc
        assert_eq!(graph.initializers().len(), 10);
    }
}
