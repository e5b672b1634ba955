//! 逆立ち判定モデルの前処理・推論・ONNXエクスポート

pub mod error;

// 画像読み込み・前処理・データセット
pub mod data;
// 設定・メタデータ・モデルの読み書き
pub mod model;
// モデル定義・推論・エクスポート
pub mod ml;

pub use error::{Error, Result};
pub use ml::{export_onnx, predict, predict_image, Architecture, ExportOptions, InferenceEngine, LoadedModel, Prediction};
pub use model::{load_model, save_model, AppConfig, DefaultBackend, ModelMetadata};
