//! 学習済みモデルのONNXエクスポート
//!
//! 重みファイル（+ サイドカー）を読み込み、ダミー入力で形状を確認してから
//! `input [batch_size, 3, 224, 224] -> output [batch_size, 1]` のONNXグラフを書き出します。

use std::path::Path;

use burn::tensor::{backend::Backend, Distribution, Tensor};
use tracing::info;

use super::onnx::{Dim, GraphBuilder, OnnxModel, ValueInfo};
use crate::data::INPUT_SIZE;
use crate::error::{Error, Result};
use crate::ml::architecture::LoadedModel;
use crate::model::model_storage::load_model;

/// エクスポート設定
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub opset_version: i64,
    /// BatchNormをConvに畳み込む（無効時はBatchNormalizationノードを出力）
    pub constant_folding: bool,
    pub input_name: String,
    pub output_name: String,
    /// 入出力の先頭軸に付ける可変長の名前
    pub batch_axis_name: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            opset_version: 11,
            constant_folding: true,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            batch_axis_name: "batch_size".to_string(),
        }
    }
}

/// 重みファイルを読み込んでONNXに変換し `destination` に書き出す
///
/// 重みファイルがなければ何も書かずに `MissingFile` を返します。
pub fn export_onnx<B: Backend>(
    weights: &Path,
    destination: &Path,
    device: &B::Device,
    options: &ExportOptions,
) -> Result<OnnxModel> {
    if !weights.is_file() {
        return Err(Error::MissingFile {
            path: weights.to_path_buf(),
        });
    }

    let model = load_model::<B>(weights, device)?;
    let onnx = build_onnx_model(&model, device, options)?;
    onnx.save(destination)?;

    info!(
        "ONNXモデルを書き出しました: {} -> {} (opset {}, {} ノード)",
        weights.display(),
        destination.display(),
        options.opset_version,
        onnx.nodes.len()
    );
    Ok(onnx)
}

/// 読み込み済みモデルからONNXグラフを構築
pub fn build_onnx_model<B: Backend>(
    model: &LoadedModel<B>,
    device: &B::Device,
    options: &ExportOptions,
) -> Result<OnnxModel> {
    let size = INPUT_SIZE as usize;
    check_trace_shape(model, device, size)?;

    let mut graph = GraphBuilder::new(options.constant_folding);
    let last = model.emit_onnx(&mut graph, &options.input_name)?;

    let batch = Dim::Dynamic(options.batch_axis_name.clone());
    let input = ValueInfo {
        name: options.input_name.clone(),
        dims: vec![
            batch.clone(),
            Dim::Fixed(3),
            Dim::Fixed(size as i64),
            Dim::Fixed(size as i64),
        ],
    };
    let output = ValueInfo {
        name: options.output_name.clone(),
        dims: vec![batch, Dim::Fixed(1)],
    };

    graph.finish(model.architecture().name(), options.opset_version, &last, input, output)
}

/// 標準正規乱数の [1, 3, size, size] を流して出力が [1, 1] になるか確認
fn check_trace_shape<B: Backend>(model: &LoadedModel<B>, device: &B::Device, size: usize) -> Result<()> {
    let dummy = Tensor::<B, 4>::random([1, 3, size, size], Distribution::Normal(0.0, 1.0), device);
    let dims = model.forward(dummy).dims();
    if dims != [1, 1] {
        return Err(Error::Export(format!(
            "model produced output of shape {dims:?}, expected [1, 1]"
        )));
    }
    Ok(())
}
