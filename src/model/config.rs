//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデルファイルの場所・ONNXエクスポート設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ml::export::ExportOptions;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド（`wgpu` フィーチャー有効時のみ）
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデルファイル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// モデルを置くディレクトリ
    pub models_dir: String,
    /// 学習済み重みファイル名（サイドカー `<stem>_metadata.json` を同じ場所に置く）
    pub weights_file: String,
    /// ONNXの出力ファイル名
    pub onnx_file: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            models_dir: "models".to_string(),
            weights_file: "final_handstand_detector_07.mpk".to_string(),
            onnx_file: "handstand_detector.onnx".to_string(),
        }
    }
}

/// ONNXエクスポート設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub opset_version: i64,
    /// BatchNormをConvに畳み込む
    pub constant_folding: bool,
    pub input_name: String,
    pub output_name: String,
    /// 可変長バッチ軸の名前
    pub batch_axis_name: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        let options = ExportOptions::default();
        Self {
            opset_version: options.opset_version,
            constant_folding: options.constant_folding,
            input_name: options.input_name,
            output_name: options.output_name,
            batch_axis_name: options.batch_axis_name,
        }
    }
}

impl ExportSettings {
    pub fn to_options(&self) -> ExportOptions {
        ExportOptions {
            opset_version: self.opset_version,
            constant_folding: self.constant_folding,
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
            batch_axis_name: self.batch_axis_name.clone(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデルファイル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// エクスポート設定
    #[serde(default)]
    pub export: ExportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 学習済み重みファイルのパス
    pub fn weights_path(&self) -> PathBuf {
        Path::new(&self.model.models_dir).join(&self.model.weights_file)
    }

    /// ONNX出力先のパス
    pub fn onnx_path(&self) -> PathBuf {
        Path::new(&self.model.models_dir).join(&self.model.onnx_file)
    }
}
