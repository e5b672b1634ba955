//! 学習用・検証用の前処理パイプライン
//!
//! どちらのパイプラインも正方形パディング -> 256x256リサイズ -> 224x224切り出し ->
//! テンソル化 -> ImageNet統計での正規化 という流れで、出力は常に [3, 224, 224] です。
//! `val` は決定的、`train` はランダムな拡張を含みます。

use std::fmt;
use std::str::FromStr;

use image::RgbImage;
use rand::Rng;

use super::augment::{self, ColorJitter, RandomAffine, RandomResizedCrop};
use super::image_tensor::ImageTensor;
use super::padding::{pad_image_to_square, IMAGE_FILL};
use crate::error::{Error, Result};

/// ImageNetの平均
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNetの標準偏差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// リサイズ後の一辺
pub const RESIZE_SIZE: u32 = 256;

/// モデル入力の一辺
pub const INPUT_SIZE: u32 = 224;

/// パイプラインを構成する1ステップ
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformStep {
    PadToSquare,
    Resize { width: u32, height: u32 },
    CenterCrop(u32),
    RandomResizedCrop(RandomResizedCrop),
    RandomHorizontalFlip(f64),
    /// 最大回転角（度）
    RandomRotation(f64),
    RandomAffine(RandomAffine),
    ColorJitter(ColorJitter),
    ToTensor,
    Normalize { mean: [f32; 3], std: [f32; 3] },
}

const VAL_STEPS: &[TransformStep] = &[
    TransformStep::PadToSquare,
    TransformStep::Resize { width: RESIZE_SIZE, height: RESIZE_SIZE },
    TransformStep::CenterCrop(INPUT_SIZE),
    TransformStep::ToTensor,
    TransformStep::Normalize { mean: IMAGENET_MEAN, std: IMAGENET_STD },
];

const TRAIN_STEPS: &[TransformStep] = &[
    TransformStep::PadToSquare,
    TransformStep::Resize { width: RESIZE_SIZE, height: RESIZE_SIZE },
    TransformStep::RandomResizedCrop(RandomResizedCrop::new(INPUT_SIZE)),
    TransformStep::RandomHorizontalFlip(0.5),
    TransformStep::RandomRotation(10.0),
    TransformStep::RandomAffine(RandomAffine { shear: 10.0, scale: (0.8, 1.2) }),
    TransformStep::ColorJitter(ColorJitter { brightness: 0.2, contrast: 0.2, saturation: 0.2 }),
    TransformStep::ToTensor,
    TransformStep::Normalize { mean: IMAGENET_MEAN, std: IMAGENET_STD },
];

/// 名前付きの前処理パイプライン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipeline {
    /// ランダム拡張あり
    Train,
    /// 決定的
    Val,
}

/// 処理途中の値（画像のままか、テンソル化済みか）
enum Stage {
    Image(RgbImage),
    Tensor(ImageTensor),
}

impl Pipeline {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "train" => Ok(Pipeline::Train),
            "val" => Ok(Pipeline::Val),
            other => Err(Error::UnknownPipeline(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Pipeline::Train => "train",
            Pipeline::Val => "val",
        }
    }

    pub fn steps(&self) -> &'static [TransformStep] {
        match self {
            Pipeline::Train => TRAIN_STEPS,
            Pipeline::Val => VAL_STEPS,
        }
    }

    /// スレッドローカル乱数で変換を適用
    pub fn apply(&self, img: &RgbImage) -> Result<ImageTensor> {
        self.apply_with_rng(img, &mut rand::thread_rng())
    }

    /// 乱数生成器を指定して変換を適用
    pub fn apply_with_rng<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> Result<ImageTensor> {
        let mut stage = Stage::Image(img.clone());
        for step in self.steps() {
            stage = apply_step(step, stage, rng)?;
        }

        match stage {
            Stage::Tensor(tensor) => Ok(tensor),
            Stage::Image(_) => Err(Error::InvalidInput(format!(
                "pipeline '{}' did not produce a tensor",
                self.name()
            ))),
        }
    }
}

impl FromStr for Pipeline {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pipeline::from_name(s)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 推論時に使うパイプライン
pub fn inference_pipeline() -> Pipeline {
    Pipeline::Val
}

fn apply_step<R: Rng + ?Sized>(step: &TransformStep, stage: Stage, rng: &mut R) -> Result<Stage> {
    let img = match stage {
        Stage::Image(img) => img,
        Stage::Tensor(tensor) => {
            return match step {
                TransformStep::Normalize { mean, std } => Ok(Stage::Tensor(normalize(tensor, mean, std))),
                other => Err(Error::InvalidInput(format!(
                    "{other:?} expects an image but received a tensor"
                ))),
            };
        }
    };

    let next = match step {
        TransformStep::PadToSquare => pad_image_to_square(&img, IMAGE_FILL),
        TransformStep::Resize { width, height } => augment::resize(&img, *width, *height),
        TransformStep::CenterCrop(size) => augment::center_crop(&img, *size),
        TransformStep::RandomResizedCrop(crop) => crop.apply(&img, rng),
        TransformStep::RandomHorizontalFlip(p) => augment::random_horizontal_flip(img, *p, rng),
        TransformStep::RandomRotation(degrees) => augment::random_rotation(&img, *degrees, rng)?,
        TransformStep::RandomAffine(affine) => affine.apply(&img, rng)?,
        TransformStep::ColorJitter(jitter) => jitter.apply(&img, rng),
        TransformStep::ToTensor => return Ok(Stage::Tensor(ImageTensor::from_rgb_unit(&img))),
        TransformStep::Normalize { .. } => {
            return Err(Error::InvalidInput(
                "Normalize expects a tensor; add ToTensor first".to_string(),
            ))
        }
    };
    Ok(Stage::Image(next))
}

/// チャネルごとに `(x - mean) / std`
pub fn normalize(mut tensor: ImageTensor, mean: &[f32; 3], std: &[f32; 3]) -> ImageTensor {
    let plane = tensor.height() * tensor.width();
    for (channel, values) in tensor.data_mut().chunks_mut(plane).enumerate() {
        let (m, s) = (mean[channel % 3], std[channel % 3]);
        for v in values {
            *v = (*v - m) / s;
        }
    }
    tensor
}
