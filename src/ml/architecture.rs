//! アーキテクチャ識別子と読み込み済みモデル

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder, RecorderError},
    tensor::{backend::Backend, Tensor},
};

use super::layers::ParamShapes;
use super::ml_model::{SimpleCnn, SimpleCnnConfig};
use super::onnx::GraphBuilder;
use super::resnet::{ResNet, ResNetConfig};
use crate::error::{Error, Result};

/// サイドカーがないときに使う識別子
pub const DEFAULT_ARCHITECTURE: &str = "resnet50";

/// 対応アーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    SimpleCnn,
    ResNet18,
    ResNet34,
    ResNet50,
}

/// 識別子とアーキテクチャの対応表
pub const REGISTRY: &[(&str, Architecture)] = &[
    ("simple_cnn", Architecture::SimpleCnn),
    ("resnet18", Architecture::ResNet18),
    ("resnet34", Architecture::ResNet34),
    ("resnet50", Architecture::ResNet50),
];

impl Architecture {
    pub fn from_name(name: &str) -> Result<Self> {
        REGISTRY
            .iter()
            .find(|(id, _)| *id == name)
            .map(|(_, arch)| *arch)
            .ok_or_else(|| Error::UnknownArchitecture(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(_, arch)| arch == self)
            .map(|(id, _)| *id)
            .unwrap_or(DEFAULT_ARCHITECTURE)
    }

    pub fn default_architecture() -> Self {
        Architecture::ResNet50
    }

    /// 初期化済み（未学習）のモデルを構築
    pub fn build<B: Backend>(&self, device: &B::Device) -> LoadedModel<B> {
        match self {
            Architecture::SimpleCnn => LoadedModel::SimpleCnn(SimpleCnnConfig::new().init(device)),
            Architecture::ResNet18 => LoadedModel::ResNet18(ResNetConfig::RESNET18.init(device)),
            Architecture::ResNet34 => LoadedModel::ResNet34(ResNetConfig::RESNET34.init(device)),
            Architecture::ResNet50 => LoadedModel::ResNet50(ResNetConfig::RESNET50.init(device)),
        }
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Architecture::from_name(s)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn recorder() -> NamedMpkBytesRecorder<FullPrecisionSettings> {
    NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
}

fn decode_record<B: Backend, M: Module<B>>(
    model: M,
    bytes: Vec<u8>,
    device: &B::Device,
) -> std::result::Result<M, RecorderError> {
    let record: M::Record = Recorder::<B>::load(&recorder(), bytes, device)?;
    Ok(model.load_record(record))
}

fn encode_record<B: Backend, M: Module<B>>(model: M) -> std::result::Result<Vec<u8>, RecorderError> {
    Recorder::<B>::record(&recorder(), model.into_record(), ())
}

/// 読み込み済みモデル（アーキテクチャごとの具体型をまとめたもの）
#[derive(Debug)]
pub enum LoadedModel<B: Backend> {
    SimpleCnn(SimpleCnn<B>),
    ResNet18(ResNet<B>),
    ResNet34(ResNet<B>),
    ResNet50(ResNet<B>),
}

impl<B: Backend> LoadedModel<B> {
    pub fn architecture(&self) -> Architecture {
        match self {
            LoadedModel::SimpleCnn(_) => Architecture::SimpleCnn,
            LoadedModel::ResNet18(_) => Architecture::ResNet18,
            LoadedModel::ResNet34(_) => Architecture::ResNet34,
            LoadedModel::ResNet50(_) => Architecture::ResNet50,
        }
    }

    /// [batch, 3, h, w] -> [batch, 1]（シグモイド出力）
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            LoadedModel::SimpleCnn(m) => m.forward(images),
            LoadedModel::ResNet18(m) | LoadedModel::ResNet34(m) | LoadedModel::ResNet50(m) => {
                m.forward(images)
            }
        }
    }

    pub fn param_shapes(&self) -> ParamShapes {
        let mut shapes = ParamShapes::new();
        match self {
            LoadedModel::SimpleCnn(m) => m.collect_shapes(&mut shapes),
            LoadedModel::ResNet18(m) | LoadedModel::ResNet34(m) | LoadedModel::ResNet50(m) => {
                m.collect_shapes(&mut shapes)
            }
        }
        shapes
    }

    pub fn emit_onnx(&self, graph: &mut GraphBuilder, input: &str) -> Result<String> {
        match self {
            LoadedModel::SimpleCnn(m) => m.emit_onnx(graph, input),
            LoadedModel::ResNet18(m) | LoadedModel::ResNet34(m) | LoadedModel::ResNet50(m) => {
                m.emit_onnx(graph, input)
            }
        }
    }

    /// 重みファイル（NamedMpk形式）を読み込む
    ///
    /// 拡張子に関係なく `path` そのものを読みます。
    pub fn load_weights(self, path: &Path, device: &B::Device) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let to_err = |e: RecorderError| Error::Weights {
            path: path.to_path_buf(),
            message: format!("{e:?}"),
        };
        Ok(match self {
            LoadedModel::SimpleCnn(m) => LoadedModel::SimpleCnn(decode_record(m, bytes, device).map_err(to_err)?),
            LoadedModel::ResNet18(m) => LoadedModel::ResNet18(decode_record(m, bytes, device).map_err(to_err)?),
            LoadedModel::ResNet34(m) => LoadedModel::ResNet34(decode_record(m, bytes, device).map_err(to_err)?),
            LoadedModel::ResNet50(m) => LoadedModel::ResNet50(decode_record(m, bytes, device).map_err(to_err)?),
        })
    }

    /// 重みをNamedMpk形式で `path` にそのまま書き出す
    pub fn save_weights(self, path: &Path) -> Result<()> {
        let bytes = match self {
            LoadedModel::SimpleCnn(m) => encode_record::<B, _>(m),
            LoadedModel::ResNet18(m) | LoadedModel::ResNet34(m) | LoadedModel::ResNet50(m) => {
                encode_record::<B, _>(m)
            }
        }
        .map_err(|e| Error::Weights {
            path: path.to_path_buf(),
            message: format!("{e:?}"),
        })?;
        std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
    }
}

impl<B: Backend> Clone for LoadedModel<B> {
    fn clone(&self) -> Self {
        match self {
            LoadedModel::SimpleCnn(m) => LoadedModel::SimpleCnn(m.clone()),
            LoadedModel::ResNet18(m) => LoadedModel::ResNet18(m.clone()),
            LoadedModel::ResNet34(m) => LoadedModel::ResNet34(m.clone()),
            LoadedModel::ResNet50(m) => LoadedModel::ResNet50(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_registry_names() {
        for (name, arch) in REGISTRY {
            assert_eq!(Architecture::from_name(name).unwrap(), *arch);
            assert_eq!(arch.name(), *name);
        }
        assert_eq!(Architecture::default_architecture().name(), DEFAULT_ARCHITECTURE);
        assert!(matches!(
            "vgg16".parse::<Architecture>(),
            Err(Error::UnknownArchitecture(name)) if name == "vgg16"
        ));
    }

    #[test]
    fn test_build_matches_architecture() {
        let device = NdArrayDevice::Cpu;
        let model = Architecture::SimpleCnn.build::<TestBackend>(&device);
        assert_eq!(model.architecture(), Architecture::SimpleCnn);

        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.forward(x).dims(), [1, 1]);
    }

    #[test]
    fn test_weights_use_exact_path() {
        let tmp = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let path = tmp.path().join("detector.bin");

        let model = Architecture::SimpleCnn.build::<TestBackend>(&device);
        model.clone().save_weights(&path).unwrap();
        assert!(path.is_file());
        assert!(!tmp.path().join("detector.mpk").exists());

        let loaded = Architecture::SimpleCnn
            .build::<TestBackend>(&device)
            .load_weights(&path, &device)
            .unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let expected = model.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.forward(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_garbage_weights_are_not_replaced_by_sibling() {
        let tmp = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        Architecture::SimpleCnn
            .build::<TestBackend>(&device)
            .save_weights(&tmp.path().join("w.mpk"))
            .unwrap();
        let pth = tmp.path().join("w.pth");
        std::fs::write(&pth, b"not a record").unwrap();

        let err = Architecture::SimpleCnn
            .build::<TestBackend>(&device)
            .load_weights(&pth, &device)
            .unwrap_err();
        assert!(matches!(err, Error::Weights { path, .. } if path == pth));
    }

    #[test]
    fn test_architectures_have_distinct_shapes() {
        let device = NdArrayDevice::Cpu;
        let cnn = Architecture::SimpleCnn.build::<TestBackend>(&device).param_shapes();
        let r18 = Architecture::ResNet18.build::<TestBackend>(&device).param_shapes();
        assert!(cnn.check_against(&r18).is_err());
        assert!(r18.num_params() > cnn.num_params());
    }
}
