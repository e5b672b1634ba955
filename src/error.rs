//! クレート共通のエラー型

use std::path::PathBuf;

use thiserror::Error;

/// 前処理・データセット・モデル読み込み・エクスポートで発生するエラー
#[derive(Debug, Error)]
pub enum Error {
    /// 重みファイル・画像・データセットのルートなどが存在しない
    #[error("file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 画像のデコード失敗（未対応フォーマットや壊れたバイト列）
    #[error("failed to decode image {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// サイドカーメタデータのJSONが壊れている
    #[error("failed to parse metadata {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown architecture '{0}'")]
    UnknownArchitecture(String),

    #[error("unknown transform pipeline '{0}' (expected 'train' or 'val')")]
    UnknownPipeline(String),

    /// レコーダーが重みを読み書きできなかった（キー不一致を含む）
    #[error("failed to load weights {}: {message}", path.display())]
    Weights { path: PathBuf, message: String },

    #[error("parameter shape mismatch at {name}: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("index {index} out of range for dataset of {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("export failed: {0}")]
    Export(String),
}

impl Error {
    /// `std::io::Error` をパス付きのエラーに変換（NotFound は `MissingFile` に寄せる）
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::MissingFile { path }
        } else {
            Error::Io { path, source }
        }
    }

    /// ファイル不在エラーかどうか
    pub fn is_missing_file(&self) -> bool {
        matches!(self, Error::MissingFile { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
