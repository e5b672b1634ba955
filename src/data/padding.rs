//! 正方形パディング
//!
//! 元画像を中央に置き、長辺に合わせた正方形キャンバスの余白を定数で埋めます。
//! 差が奇数のときは余った1ピクセルが右側（下側）に付きます。リサイズは行いません。

use image::{imageops, Rgb, RgbImage};

use super::image_tensor::ImageTensor;

/// テンソル経路のデフォルト塗りつぶし値（白）
pub const TENSOR_FILL: f32 = 255.0;

/// 画像経路のデフォルト塗りつぶし色（白）
pub const IMAGE_FILL: Rgb<u8> = Rgb([255, 255, 255]);

/// パディング対象
#[derive(Debug, Clone, PartialEq)]
pub enum PadInput {
    /// デコード済みRGB画像
    Image(RgbImage),
    /// (C, H, W) の生テンソル
    Tensor(ImageTensor),
}

impl PadInput {
    /// (幅, 高さ)
    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            PadInput::Image(img) => (img.width() as usize, img.height() as usize),
            PadInput::Tensor(t) => (t.width(), t.height()),
        }
    }
}

/// デフォルトの白で正方形にパディング
pub fn pad_to_square(input: PadInput) -> PadInput {
    match input {
        PadInput::Image(img) => PadInput::Image(pad_image_to_square(&img, IMAGE_FILL)),
        PadInput::Tensor(t) => PadInput::Tensor(pad_tensor_to_square(&t, TENSOR_FILL)),
    }
}

/// 左上の貼り付け位置 (x, y) と一辺の長さ
fn square_layout(width: usize, height: usize) -> (usize, usize, usize) {
    let max_size = width.max(height);
    ((max_size - width) / 2, (max_size - height) / 2, max_size)
}

pub fn pad_image_to_square(img: &RgbImage, fill: Rgb<u8>) -> RgbImage {
    let (width, height) = img.dimensions();
    let (paste_x, paste_y, max_size) = square_layout(width as usize, height as usize);

    let mut canvas = RgbImage::from_pixel(max_size as u32, max_size as u32, fill);
    imageops::replace(&mut canvas, img, paste_x as i64, paste_y as i64);
    canvas
}

pub fn pad_tensor_to_square(tensor: &ImageTensor, fill: f32) -> ImageTensor {
    let [c, h, w] = tensor.shape();
    let (paste_x, paste_y, max_size) = square_layout(w, h);

    let mut padded = ImageTensor::full([c, max_size, max_size], fill);
    let src = tensor.data();
    let dst = padded.data_mut();
    for ch in 0..c {
        for row in 0..h {
            let src_start = (ch * h + row) * w;
            let dst_start = (ch * max_size + row + paste_y) * max_size + paste_x;
            dst[dst_start..dst_start + w].copy_from_slice(&src[src_start..src_start + w]);
        }
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_image_is_centered_vertically() {
        let img = RgbImage::from_pixel(100, 50, Rgb([0, 0, 0]));
        let padded = pad_image_to_square(&img, IMAGE_FILL);

        assert_eq!(padded.dimensions(), (100, 100));
        assert_eq!(*padded.get_pixel(50, 24), IMAGE_FILL);
        assert_eq!(*padded.get_pixel(50, 25), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(50, 74), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(50, 75), IMAGE_FILL);
    }

    #[test]
    fn test_odd_difference_puts_extra_pixel_on_trailing_side() {
        // 幅3・高さ6 -> 左1列, 右2列
        let img = RgbImage::from_pixel(3, 6, Rgb([9, 9, 9]));
        let padded = pad_image_to_square(&img, IMAGE_FILL);

        assert_eq!(padded.dimensions(), (6, 6));
        assert_eq!(*padded.get_pixel(0, 0), IMAGE_FILL);
        assert_eq!(*padded.get_pixel(1, 0), Rgb([9, 9, 9]));
        assert_eq!(*padded.get_pixel(3, 0), Rgb([9, 9, 9]));
        assert_eq!(*padded.get_pixel(4, 0), IMAGE_FILL);
        assert_eq!(*padded.get_pixel(5, 0), IMAGE_FILL);
    }

    #[test]
    fn test_square_input_is_unchanged() {
        let img = RgbImage::from_pixel(7, 7, Rgb([1, 2, 3]));
        assert_eq!(pad_image_to_square(&img, IMAGE_FILL), img);
    }

    #[test]
    fn test_tensor_path_matches_layout() {
        let tensor = ImageTensor::new((0..2 * 2 * 5).map(|v| v as f32).collect(), [2, 2, 5]).unwrap();
        let padded = pad_tensor_to_square(&tensor, TENSOR_FILL);

        assert_eq!(padded.shape(), [2, 5, 5]);
        // (5 - 2) / 2 = 1 行目から元データ
        assert_eq!(padded.get(0, 0, 0), TENSOR_FILL);
        assert_eq!(padded.get(0, 1, 0), 0.0);
        assert_eq!(padded.get(1, 2, 4), 19.0);
        assert_eq!(padded.get(1, 3, 4), TENSOR_FILL);
        assert_eq!(padded.get(1, 4, 4), TENSOR_FILL);
    }

    #[test]
    fn test_output_side_is_max_dimension() {
        for (w, h) in [(1, 9), (9, 1), (13, 8), (64, 64), (2, 3)] {
            let padded = pad_to_square(PadInput::Image(RgbImage::new(w, h)));
            let side = w.max(h) as usize;
            assert_eq!(padded.dimensions(), (side, side));

            let tensor = ImageTensor::full([3, h as usize, w as usize], 0.0);
            let padded = pad_to_square(PadInput::Tensor(tensor));
            assert_eq!(padded.dimensions(), (side, side));
        }
    }
}
