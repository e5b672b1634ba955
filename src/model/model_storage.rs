//! モデルの読み込み・保存
//!
//! ファイル構成:
//! - `<stem>.<ext>`          - モデルの重み（burn NamedMpk形式。拡張子は問わず、指定パスをそのまま使う）
//! - `<stem>_metadata.json`  - サイドカーメタデータ（アーキテクチャ名など）
//!
//! サイドカーがない場合は警告を出して `resnet50` として読み込みます。

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ml::architecture::{Architecture, LoadedModel};
use crate::model::model_metadata::ModelMetadata;

/// アーキテクチャをどこから決めたか
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchitectureSource {
    Sidecar(PathBuf),
    Default,
}

/// 決定したアーキテクチャ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArchitecture {
    pub architecture: Architecture,
    pub source: ArchitectureSource,
}

/// 重みファイルに対応するサイドカーのパス（`<dir>/<stem>_metadata.json`）
pub fn metadata_path_for(weights: &Path) -> PathBuf {
    let stem = weights
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    weights.with_file_name(format!("{stem}_metadata.json"))
}

/// サイドカーからアーキテクチャを決める
pub fn resolve_architecture(weights: &Path) -> Result<ResolvedArchitecture> {
    let sidecar = metadata_path_for(weights);
    if !sidecar.exists() {
        warn!(
            "メタデータが見つかりません: {}。デフォルトモデル ({}) を使用します",
            sidecar.display(),
            Architecture::default_architecture()
        );
        return Ok(ResolvedArchitecture {
            architecture: Architecture::default_architecture(),
            source: ArchitectureSource::Default,
        });
    }

    let metadata = ModelMetadata::load(&sidecar)?;
    let architecture = Architecture::from_name(&metadata.architecture)?;
    debug!("メタデータを読み込みました: {} -> {}", sidecar.display(), architecture);

    Ok(ResolvedArchitecture {
        architecture,
        source: ArchitectureSource::Sidecar(sidecar),
    })
}

/// 重みファイルからモデルを読み込む
///
/// 1. 重みファイルがなければ `MissingFile`
/// 2. サイドカーでアーキテクチャを決定し、`device` 上にモデルを構築
/// 3. 重みを読み込み、読み込み前後でパラメータ形状が一致するか確認
pub fn load_model<B: Backend>(weights: &Path, device: &B::Device) -> Result<LoadedModel<B>> {
    load_model_resolved(weights, device).map(|(model, _)| model)
}

/// `load_model` と同じだが、決定したアーキテクチャも返す
pub fn load_model_resolved<B: Backend>(
    weights: &Path,
    device: &B::Device,
) -> Result<(LoadedModel<B>, ResolvedArchitecture)> {
    if !weights.is_file() {
        return Err(Error::MissingFile {
            path: weights.to_path_buf(),
        });
    }

    let resolved = resolve_architecture(weights)?;
    let model = resolved.architecture.build::<B>(device);
    let expected = model.param_shapes();

    let model = model.load_weights(weights, device)?;
    expected.check_against(&model.param_shapes())?;

    info!(
        "モデルを読み込みました: {} ({}, {} パラメータ)",
        weights.display(),
        resolved.architecture,
        expected.num_params()
    );
    Ok((model, resolved))
}

/// 重みとサイドカーを保存
///
/// メタデータのアーキテクチャ名はモデルに合わせて上書きします。
pub fn save_model<B: Backend>(model: &LoadedModel<B>, weights: &Path, metadata: &ModelMetadata) -> Result<()> {
    if let Some(parent) = weights.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    model.clone().save_weights(weights)?;

    let mut metadata = metadata.clone();
    metadata.architecture = model.architecture().name().to_string();
    let sidecar = metadata_path_for(weights);
    metadata.save(&sidecar)?;

    info!("モデルを保存しました: {} (+ {})", weights.display(), sidecar.display());
    Ok(())
}
