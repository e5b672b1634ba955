//! ResNet (18 / 34 / 50) に二値分類ヘッドを付けたモデル
//!
//! 18と34はBasicBlock、50はBottleneck（拡張率4、ストライドは3x3側）を使います。

use burn::{
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::layers::{flatten_pooled, BinaryHead, ConvBn, ParamShapes};
use super::onnx::{ConvSpec, GraphBuilder};
use crate::error::Result;

/// 各ステージの出力チャネル（Bottleneckでは中間チャネル）
const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];

const HEAD_DROPOUT: f64 = 0.5;

const STEM_POOL: ConvSpec = ConvSpec {
    kernel: 3,
    stride: 2,
    padding: 1,
};

/// ブロックの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

/// ResNetの深さ設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResNetConfig {
    pub block: BlockKind,
    pub layers: [usize; 4],
}

impl ResNetConfig {
    pub const RESNET18: Self = Self {
        block: BlockKind::Basic,
        layers: [2, 2, 2, 2],
    };
    pub const RESNET34: Self = Self {
        block: BlockKind::Basic,
        layers: [3, 4, 6, 3],
    };
    pub const RESNET50: Self = Self {
        block: BlockKind::Bottleneck,
        layers: [3, 4, 6, 3],
    };

    /// 特徴ベクトルの次元（ヘッドの入力）
    pub fn feature_dim(&self) -> usize {
        STAGE_WIDTHS[3] * self.block.expansion()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let expansion = self.block.expansion();
        let mut in_channels = 64;
        let mut blocks = Vec::new();

        for (stage, (&width, &count)) in STAGE_WIDTHS.iter().zip(self.layers.iter()).enumerate() {
            let stride = if stage == 0 { 1 } else { 2 };
            for i in 0..count {
                let s = if i == 0 { stride } else { 1 };
                blocks.push(ResidualBlock::new(self.block, in_channels, width, s, device));
                in_channels = width * expansion;
            }
        }

        ResNet {
            stem: ConvBn::new(3, 64, 7, 2, 3, device),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            blocks,
            gap: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: BinaryHead::new(in_channels, HEAD_DROPOUT, device),
            activation: Relu::new(),
        }
    }
}

/// 残差ブロック
///
/// `convs` を順に通し（最後以外はReLU）、ショートカットと足してReLU。
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    convs: Vec<ConvBn<B>>,
    downsample: Option<ConvBn<B>>,
    activation: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(kind: BlockKind, in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * kind.expansion();
        let convs = match kind {
            BlockKind::Basic => vec![
                ConvBn::new(in_channels, width, 3, stride, 1, device),
                ConvBn::new(width, width, 3, 1, 1, device),
            ],
            BlockKind::Bottleneck => vec![
                ConvBn::new(in_channels, width, 1, 1, 0, device),
                ConvBn::new(width, width, 3, stride, 1, device),
                ConvBn::new(width, out_channels, 1, 1, 0, device),
            ],
        };
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| ConvBn::new(in_channels, out_channels, 1, stride, 0, device));

        Self {
            convs,
            downsample,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.forward(x.clone()),
            None => x.clone(),
        };

        let last = self.convs.len() - 1;
        let mut out = x;
        for (i, conv) in self.convs.iter().enumerate() {
            out = conv.forward(out);
            if i != last {
                out = self.activation.forward(out);
            }
        }
        self.activation.forward(out + identity)
    }

    fn collect_shapes(&self, prefix: &str, out: &mut ParamShapes) {
        for (i, conv) in self.convs.iter().enumerate() {
            conv.collect_shapes(&format!("{prefix}.convs.{i}"), out);
        }
        if let Some(down) = &self.downsample {
            down.collect_shapes(&format!("{prefix}.downsample"), out);
        }
    }

    fn emit(&self, graph: &mut GraphBuilder, prefix: &str, input: &str) -> Result<String> {
        let identity = match &self.downsample {
            Some(down) => down.emit(graph, &format!("{prefix}.downsample"), input)?,
            None => input.to_string(),
        };

        let last = self.convs.len() - 1;
        let mut x = input.to_string();
        for (i, conv) in self.convs.iter().enumerate() {
            x = conv.emit(graph, &format!("{prefix}.convs.{i}"), &x)?;
            if i != last {
                x = graph.relu(&x);
            }
        }
        let x = graph.add(&x, &identity);
        Ok(graph.relu(&x))
    }
}

/// ResNet本体
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: ConvBn<B>,
    pool: MaxPool2d,
    blocks: Vec<ResidualBlock<B>>,
    gap: AdaptiveAvgPool2d,
    head: BinaryHead<B>,
    activation: Relu,
}

impl<B: Backend> ResNet<B> {
    /// [batch, 3, h, w] -> [batch, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.stem.forward(images));
        let mut x = self.pool.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = flatten_pooled(self.gap.forward(x));
        self.head.forward(x)
    }

    pub fn collect_shapes(&self, out: &mut ParamShapes) {
        self.stem.collect_shapes("stem", out);
        for (i, block) in self.blocks.iter().enumerate() {
            block.collect_shapes(&format!("blocks.{i}"), out);
        }
        self.head.collect_shapes("head", out);
    }

    pub fn emit_onnx(&self, graph: &mut GraphBuilder, input: &str) -> Result<String> {
        let x = self.stem.emit(graph, "stem", input)?;
        let x = graph.relu(&x);
        let mut x = graph.max_pool(&x, STEM_POOL);
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.emit(graph, &format!("blocks.{i}"), &x)?;
        }
        let x = graph.global_average_pool(&x);
        let x = graph.flatten(&x);
        self.head.emit(graph, "head", &x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_block_counts() {
        let device = NdArrayDevice::Cpu;
        let model = ResNetConfig::RESNET18.init::<TestBackend>(&device);
        assert_eq!(model.blocks.len(), 8);
        // ステージ先頭のみダウンサンプル（第1ステージは 64 -> 64 なので不要）
        let downsampled = model.blocks.iter().filter(|b| b.downsample.is_some()).count();
        assert_eq!(downsampled, 3);
    }

    #[test]
    fn test_feature_dims() {
        assert_eq!(ResNetConfig::RESNET18.feature_dim(), 512);
        assert_eq!(ResNetConfig::RESNET34.feature_dim(), 512);
        assert_eq!(ResNetConfig::RESNET50.feature_dim(), 2048);
    }

    #[test]
    fn test_resnet18_forward_small_input() {
        let device = NdArrayDevice::Cpu;
        let model = ResNetConfig::RESNET18.init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        assert_eq!(model.forward(x).dims(), [1, 1]);
    }

    #[test]
    fn test_bottleneck_first_block_projects() {
        let device = NdArrayDevice::Cpu;
        let block = ResidualBlock::<TestBackend>::new(BlockKind::Bottleneck, 64, 64, 1, &device);
        assert_eq!(block.convs.len(), 3);
        assert!(block.downsample.is_some());

        let x = Tensor::<TestBackend, 4>::zeros([1, 64, 8, 8], &device);
        assert_eq!(block.forward(x).dims(), [1, 256, 8, 8]);
    }

    #[test]
    fn test_unfolded_export_keeps_batch_norm() {
        let device = NdArrayDevice::Cpu;
        let model = ResNetConfig::RESNET18.init::<TestBackend>(&device);

        let mut folded = GraphBuilder::new(true);
        model.emit_onnx(&mut folded, "input").unwrap();
        assert!(folded.nodes().iter().all(|n| n.op_type != "BatchNormalization"));

        let mut explicit = GraphBuilder::new(false);
        model.emit_onnx(&mut explicit, "input").unwrap();
        let bn_count = explicit
            .nodes()
            .iter()
            .filter(|n| n.op_type == "BatchNormalization")
            .count();
        // stem + 8ブロック x 2 + ダウンサンプル3
        assert_eq!(bn_count, 1 + 16 + 3);
    }
}
