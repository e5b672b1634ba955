//! 学習済みモデルをONNXに変換するバイナリ
//!
//! `config.json` の `models_dir` / `weights_file` / `onnx_file` に従って変換します
//! （デフォルト: models/final_handstand_detector_07.mpk -> models/handstand_detector.onnx）。

use anyhow::{Context, Result};
use handstand_detector::ml::onnx::inspect;
use handstand_detector::model::select_device;
use handstand_detector::{export_onnx, AppConfig, DefaultBackend};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load_or_default();
    let weights = config.weights_path();
    let destination = config.onnx_path();
    let device = select_device(config.device_type);

    let onnx = export_onnx::<DefaultBackend>(&weights, &destination, &device, &config.export.to_options())
        .with_context(|| format!("ONNXへの変換に失敗しました: {}", weights.display()))?;

    let summary = inspect(&onnx.to_bytes()).context("書き出したONNXの検証に失敗しました")?;
    println!("=== ONNXエクスポート完了 ===");
    println!("入力: {} -> {}", weights.display(), destination.display());
    println!("opset: {} (IR {})", summary.opset_version, summary.ir_version);
    for input in &summary.inputs {
        println!("入力テンソル: {} {:?}", input.name, input.dims);
    }
    for output in &summary.outputs {
        println!("出力テンソル: {} {:?}", output.name, output.dims);
    }
    println!("埋め込みパラメータ: {}", summary.initializer_count);
    println!("Model converted and saved to {}", destination.display());

    Ok(())
}
