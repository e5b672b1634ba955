//! モデルのサイドカーメタデータ
//!
//! 重みファイル `<stem>.mpk` と同じディレクトリに `<stem>_metadata.json` として置きます。
//!
//! ```json
//! { "architecture": "resnet50", "class_names": ["handstand", "not_handstand"] }
//! ```
//!
//! 必須なのは `architecture` だけで、未知のキーは無視します。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_input_size() -> u32 {
    224
}

/// モデルメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// アーキテクチャ識別子（例: "resnet50"）
    pub architecture: String,

    /// クラス名（データセットのソート順）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_names: Vec<String>,

    /// モデル入力サイズ（正方形）
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// 学習時刻（RFC 3339）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trained_at: Option<String>,
}

impl ModelMetadata {
    /// 現在時刻を学習時刻として新しいメタデータを作成
    pub fn new(architecture: impl Into<String>, class_names: Vec<String>) -> Self {
        Self {
            architecture: architecture.into(),
            class_names,
            input_size: default_input_size(),
            trained_at: Some(chrono::Local::now().to_rfc3339()),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidInput(format!("failed to serialize metadata: {e}")))
    }

    /// ファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&content).map_err(|source| Error::Metadata {
            path: path.to_path_buf(),
            source,
        })
    }

    /// ファイルに保存
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json_string()?).map_err(|e| Error::io(path, e))
    }
}
