//! モデル推論機能

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::RgbImage;
use serde::Serialize;
use tracing::debug;

use crate::data::{decode_data_url, inference_pipeline, load_rgb_image};
use crate::error::{Error, Result};
use crate::ml::architecture::{Architecture, LoadedModel};
use crate::model::model_storage::{load_model_resolved, ResolvedArchitecture};

/// 判定のしきい値
pub const THRESHOLD: f32 = 0.5;

/// 1枚分の推論結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub is_handstand: bool,
    /// 逆立ちである確率（`1 - raw_output`）
    pub probability: f32,
    /// モデルのシグモイド出力そのまま
    pub raw_output: f32,
}

impl Prediction {
    /// 生出力から判定を作る
    ///
    /// 学習時のラベル順の都合で、モデル出力は「逆立ちでない」確率になっています。
    pub fn from_raw_output(raw_output: f32) -> Self {
        let probability = 1.0 - raw_output;
        Self {
            is_handstand: probability >= THRESHOLD,
            probability,
            raw_output,
        }
    }
}

/// 前処理済みの [1, 3, 224, 224] テンソルを判定
///
/// 出力がちょうど1要素でなければ `InvalidInput`（バッチサイズは1のみ）。
pub fn predict<B: Backend>(model: &LoadedModel<B>, images: Tensor<B, 4>) -> Result<Prediction> {
    let output = model.forward(images);
    let values = output
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::InvalidInput(format!("failed to read model output: {e:?}")))?;

    match values.as_slice() {
        [raw] => Ok(Prediction::from_raw_output(*raw)),
        other => Err(Error::InvalidInput(format!(
            "expected a single output value (batch size 1), got {}",
            other.len()
        ))),
    }
}

/// デコード済み画像を `val` パイプラインで前処理して判定
pub fn predict_image<B: Backend>(model: &LoadedModel<B>, img: &RgbImage, device: &B::Device) -> Result<Prediction> {
    let tensor = inference_pipeline().apply(img)?;
    predict(model, tensor.to_batch::<B>(device))
}

/// 推論エンジン
///
/// モデル・デバイス・アーキテクチャの決定結果をまとめて持ち、画像を繰り返し判定します。
pub struct InferenceEngine<B: Backend> {
    model: LoadedModel<B>,
    resolved: ResolvedArchitecture,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(weights: P, device: B::Device) -> Result<Self> {
        let (model, resolved) = load_model_resolved::<B>(weights.as_ref(), &device)?;
        Ok(Self {
            model,
            resolved,
            device,
        })
    }

    /// 単一画像ファイルを判定
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let img = load_rgb_image(image_path.as_ref())?;
        let prediction = predict_image(&self.model, &img, &self.device)?;
        debug!(
            "{}: is_handstand={} probability={:.4}",
            image_path.as_ref().display(),
            prediction.is_handstand,
            prediction.probability
        );
        Ok(prediction)
    }

    /// `data:image/...;base64,...` 形式の画像を判定
    pub fn classify_data_url(&self, data_url: &str) -> Result<Prediction> {
        let img = decode_data_url(data_url)?;
        predict_image(&self.model, &img, &self.device)
    }

    pub fn architecture(&self) -> Architecture {
        self.resolved.architecture
    }

    pub fn resolved(&self) -> &ResolvedArchitecture {
        &self.resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_probability_is_flipped() {
        let p = Prediction::from_raw_output(0.2);
        assert!((p.probability - 0.8).abs() < 1e-6);
        assert!(p.is_handstand);

        let p = Prediction::from_raw_output(0.9);
        assert!(!p.is_handstand);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let p = Prediction::from_raw_output(0.5);
        assert_eq!(p.probability, 0.5);
        assert!(p.is_handstand);
    }

    #[test]
    fn test_predict_rejects_batches() {
        let device = NdArrayDevice::Cpu;
        let model = Architecture::SimpleCnn.build::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert!(matches!(predict(&model, x), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_predict_image_probability_range() {
        let device = NdArrayDevice::Cpu;
        let model = Architecture::SimpleCnn.build::<TestBackend>(&device);
        let img = RgbImage::from_pixel(100, 50, image::Rgb([255, 255, 255]));

        let p = predict_image(&model, &img, &device).unwrap();
        assert!((0.0..=1.0).contains(&p.probability));
        assert_eq!(p.is_handstand, p.probability >= THRESHOLD);
    }
}
