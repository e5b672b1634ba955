//! 画像の幾何変換・データ拡張
//!
//! 決定的な変換（リサイズ・中央切り出し）と、乱数を使う拡張
//! （ランダムクロップ・反転・回転・アフィン・色調変化）をRGB画像に対して行います。

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};

/// 回転・アフィンで画像外になった画素の色
const WARP_FILL: Rgb<u8> = Rgb([0, 0, 0]);

/// バイリニア補間で (width, height) にリサイズ
pub fn resize(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    imageops::resize(img, width, height, FilterType::Triangle)
}

/// 中央から size x size を切り出す
///
/// オフセットは `round((辺 - size) / 2)`（偶数丸め）。画像が小さい場合は黒で埋めてから切り出します。
pub fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width < size || height < size {
        let mut canvas = RgbImage::from_pixel(width.max(size), height.max(size), WARP_FILL);
        let x = (canvas.width() - width) / 2;
        let y = (canvas.height() - height) / 2;
        imageops::replace(&mut canvas, img, x as i64, y as i64);
        return center_crop(&canvas, size);
    }

    // 0.5 は偶数側に丸める
    let left = ((width - size) as f64 / 2.0).round_ties_even() as u32;
    let top = ((height - size) as f64 / 2.0).round_ties_even() as u32;
    imageops::crop_imm(img, left, top, size, size).to_image()
}

/// ランダムな領域を切り出して size x size にリサイズ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomResizedCrop {
    pub size: u32,
    /// 元画像面積に対する切り出し面積の範囲
    pub scale: (f64, f64),
    /// 切り出し領域のアスペクト比（幅/高さ）の範囲
    pub ratio: (f64, f64),
}

const CROP_RATIO: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);

impl RandomResizedCrop {
    pub const fn new(size: u32) -> Self {
        Self {
            size,
            scale: (0.08, 1.0),
            ratio: CROP_RATIO,
        }
    }

    /// 切り出し領域 (left, top, width, height) を決める
    pub fn sample_region<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> (u32, u32, u32, u32) {
        let area = width as f64 * height as f64;
        let (log_lo, log_hi) = (self.ratio.0.ln(), self.ratio.1.ln());

        for _ in 0..10 {
            let target_area = area * rng.gen_range(self.scale.0..=self.scale.1);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();

            let w = (target_area * aspect).sqrt().round() as u32;
            let h = (target_area / aspect).sqrt().round() as u32;

            if w > 0 && h > 0 && w <= width && h <= height {
                let top = rng.gen_range(0..=height - h);
                let left = rng.gen_range(0..=width - w);
                return (left, top, w, h);
            }
        }

        // フォールバック: アスペクト比を範囲内に収めた中央切り出し
        let in_ratio = width as f64 / height as f64;
        let (w, h) = if in_ratio < self.ratio.0 {
            (width, (width as f64 / self.ratio.0).round() as u32)
        } else if in_ratio > self.ratio.1 {
            ((height as f64 * self.ratio.1).round() as u32, height)
        } else {
            (width, height)
        };
        ((width - w) / 2, (height - h) / 2, w, h)
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let (left, top, w, h) = self.sample_region(img.width(), img.height(), rng);
        let region = imageops::crop_imm(img, left, top, w, h).to_image();
        resize(&region, self.size, self.size)
    }
}

/// 確率 p で左右反転
pub fn random_horizontal_flip<R: Rng + ?Sized>(img: RgbImage, p: f64, rng: &mut R) -> RgbImage {
    if rng.gen::<f64>() < p {
        imageops::flip_horizontal(&img)
    } else {
        img
    }
}

/// 画像中心まわりの 2x3 アフィン行列を組み立てる（角度は度、反時計回りが正）
///
/// 行列は 入力座標 -> 出力座標 の順方向写像です。
fn centered_affine(width: u32, height: u32, angle: f64, shear_x: f64, scale: f64) -> [f32; 9] {
    let cx = width as f64 * 0.5;
    let cy = height as f64 * 0.5;

    let rot = -angle.to_radians();
    let shear = -shear_x.to_radians();

    // R * Shear * S
    let (sin, cos) = rot.sin_cos();
    let tan = shear.tan();
    let a = cos * scale;
    let b = (cos * tan - sin) * scale;
    let c = sin * scale;
    let d = (sin * tan + cos) * scale;

    // T(c) * M * T(-c)
    let tx = cx - a * cx - b * cy;
    let ty = cy - c * cx - d * cy;

    [
        a as f32, b as f32, tx as f32,
        c as f32, d as f32, ty as f32,
        0.0, 0.0, 1.0,
    ]
}

fn warp_affine(img: &RgbImage, matrix: [f32; 9]) -> Result<RgbImage> {
    let projection = Projection::from_matrix(matrix)
        .ok_or_else(|| Error::InvalidInput("degenerate affine matrix".to_string()))?;
    Ok(warp(img, &projection, Interpolation::Nearest, WARP_FILL))
}

/// [-degrees, degrees] の一様乱数で回転（サイズは変えない）
pub fn random_rotation<R: Rng + ?Sized>(img: &RgbImage, degrees: f64, rng: &mut R) -> Result<RgbImage> {
    let angle = rng.gen_range(-degrees..=degrees);
    warp_affine(img, centered_affine(img.width(), img.height(), angle, 0.0, 1.0))
}

/// 回転なしのランダムアフィン（x方向せん断と拡大縮小）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomAffine {
    pub shear: f64,
    pub scale: (f64, f64),
}

impl RandomAffine {
    pub fn apply<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> Result<RgbImage> {
        let shear = rng.gen_range(-self.shear..=self.shear);
        let scale = rng.gen_range(self.scale.0..=self.scale.1);
        warp_affine(img, centered_affine(img.width(), img.height(), 0.0, shear, scale))
    }
}

/// 明るさ・コントラスト・彩度のランダム変化
///
/// 各係数は `[max(0, 1 - v), 1 + v]` から選ばれ、3つの調整はランダムな順序で適用されます。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
}

#[derive(Debug, Clone, Copy)]
enum JitterOp {
    Brightness,
    Contrast,
    Saturation,
}

impl ColorJitter {
    pub fn apply<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let mut ops = [JitterOp::Brightness, JitterOp::Contrast, JitterOp::Saturation];
        ops.shuffle(rng);

        let mut out = img.clone();
        for op in ops {
            match op {
                JitterOp::Brightness => {
                    if let Some(f) = sample_factor(self.brightness, rng) {
                        adjust_brightness(&mut out, f);
                    }
                }
                JitterOp::Contrast => {
                    if let Some(f) = sample_factor(self.contrast, rng) {
                        adjust_contrast(&mut out, f);
                    }
                }
                JitterOp::Saturation => {
                    if let Some(f) = sample_factor(self.saturation, rng) {
                        adjust_saturation(&mut out, f);
                    }
                }
            }
        }
        out
    }
}

fn sample_factor<R: Rng + ?Sized>(amount: f32, rng: &mut R) -> Option<f32> {
    if amount <= 0.0 {
        return None;
    }
    Some(rng.gen_range((1.0 - amount).max(0.0)..=1.0 + amount))
}

fn luma(p: &Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

fn blend(value: f32, other: f32, factor: f32) -> u8 {
    (factor * value + (1.0 - factor) * other).round().clamp(0.0, 255.0) as u8
}

pub fn adjust_brightness(img: &mut RgbImage, factor: f32) {
    for p in img.pixels_mut() {
        for c in 0..3 {
            p[c] = blend(p[c] as f32, 0.0, factor);
        }
    }
}

pub fn adjust_contrast(img: &mut RgbImage, factor: f32) {
    let pixels = (img.width() * img.height()).max(1) as f32;
    let mean = img.pixels().map(luma).sum::<f32>() / pixels;
    for p in img.pixels_mut() {
        for c in 0..3 {
            p[c] = blend(p[c] as f32, mean, factor);
        }
    }
}

pub fn adjust_saturation(img: &mut RgbImage, factor: f32) {
    for p in img.pixels_mut() {
        let gray = luma(p);
        for c in 0..3 {
            p[c] = blend(p[c] as f32, gray, factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 128]))
    }

    #[test]
    fn test_center_crop_offset() {
        let img = gradient(256, 256);
        let cropped = center_crop(&img, 224);
        assert_eq!(cropped.dimensions(), (224, 224));
        assert_eq!(cropped.get_pixel(0, 0), img.get_pixel(16, 16));
    }

    #[test]
    fn test_center_crop_rounds_half_to_even() {
        // (229 - 224) / 2 = 2.5 -> 2, (231 - 224) / 2 = 3.5 -> 4
        let img = gradient(229, 231);
        let cropped = center_crop(&img, 224);
        assert_eq!(cropped.get_pixel(0, 0), img.get_pixel(2, 4));
    }

    #[test]
    fn test_sample_region_on_huge_dimensions() {
        let crop = RandomResizedCrop::new(224);
        let mut rng = StdRng::seed_from_u64(3);
        let (left, top, w, h) = crop.sample_region(100_000, 100_000, &mut rng);
        assert!(w > 0 && h > 0);
        assert!(left as u64 + w as u64 <= 100_000);
        assert!(top as u64 + h as u64 <= 100_000);
    }

    #[test]
    fn test_center_crop_pads_small_images() {
        let cropped = center_crop(&gradient(10, 300), 224);
        assert_eq!(cropped.dimensions(), (224, 224));
    }

    #[test]
    fn test_random_resized_crop_region_stays_inside() {
        let crop = RandomResizedCrop::new(224);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let (left, top, w, h) = crop.sample_region(256, 256, &mut rng);
            assert!(w > 0 && h > 0);
            assert!(left + w <= 256);
            assert!(top + h <= 256);
        }
        let out = crop.apply(&gradient(256, 256), &mut rng);
        assert_eq!(out.dimensions(), (224, 224));
    }

    #[test]
    fn test_flip_probability_extremes() {
        let img = gradient(4, 2);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(random_horizontal_flip(img.clone(), 0.0, &mut rng), img);
        let flipped = random_horizontal_flip(img.clone(), 1.0, &mut rng);
        assert_eq!(flipped.get_pixel(0, 0), img.get_pixel(3, 0));
    }

    #[test]
    fn test_identity_affine_keeps_pixels() {
        let img = gradient(16, 12);
        let out = warp_affine(&img, centered_affine(16, 12, 0.0, 0.0, 1.0)).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_rotation_and_affine_keep_size() {
        let img = gradient(32, 32);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(random_rotation(&img, 10.0, &mut rng).unwrap().dimensions(), (32, 32));

        let affine = RandomAffine { shear: 10.0, scale: (0.8, 1.2) };
        assert_eq!(affine.apply(&img, &mut rng).unwrap().dimensions(), (32, 32));
    }

    #[test]
    fn test_saturation_zero_gives_gray() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([200, 40, 90]));
        adjust_saturation(&mut img, 0.0);
        let p = img.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }

    #[test]
    fn test_color_jitter_with_zero_amounts_is_identity() {
        let img = gradient(8, 8);
        let jitter = ColorJitter { brightness: 0.0, contrast: 0.0, saturation: 0.0 };
        let mut rng = StdRng::seed_from_u64(11);
        assert_eq!(jitter.apply(&img, &mut rng), img);
    }
}
