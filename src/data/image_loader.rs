//! 画像ファイルの読み込み
//!
//! 拡張子ではなく中身からフォーマットを判定してデコードし、常にRGB8に変換します。
//! AVIFのデコードは `avif` フィーチャー（`image/avif-native`）で有効になります。

use std::path::Path;

use base64::Engine as _;
use image::{DynamicImage, RgbImage};

use crate::error::{Error, Result};

/// 画像ファイルを読み込んでRGB画像に変換
///
/// パレット画像はデコード時にRGBAへ展開され、その後アルファを捨ててRGBに平坦化されます。
pub fn load_rgb_image(path: &Path) -> Result<RgbImage> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    decode_rgb(&bytes, &path.display().to_string())
}

/// メモリ上のバイト列をRGB画像にデコード
pub fn decode_rgb(bytes: &[u8], origin: &str) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes).map_err(|source| Error::Decode {
        origin: origin.to_string(),
        source,
    })?;
    Ok(flatten_to_rgb(img))
}

/// `data:image/png;base64,...` 形式（またはbase64本体のみ）の画像をデコード
pub fn decode_data_url(data_url: &str) -> Result<RgbImage> {
    let payload = match data_url.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => {
            if !header.ends_with(";base64") {
                return Err(Error::InvalidInput(format!(
                    "data URL is not base64 encoded: {header}"
                )));
            }
            payload
        }
        _ => data_url,
    };

    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
    decode_rgb(&bytes, "data URL")
}

fn flatten_to_rgb(img: DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb,
        // 透過チャネルは合成せずに破棄する
        other => other.into_rgb8(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_rgba_is_flattened_without_compositing() {
        let mut rgba = RgbaImage::new(2, 1);
        rgba.put_pixel(0, 0, Rgba([10, 20, 30, 0]));
        rgba.put_pixel(1, 0, Rgba([200, 100, 50, 255]));
        let bytes = png_bytes(&DynamicImage::ImageRgba8(rgba));

        let rgb = decode_rgb(&bytes, "test").unwrap();
        assert_eq!(rgb.dimensions(), (2, 1));
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([10, 20, 30]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([200, 100, 50]));
    }

    #[test]
    fn test_palette_with_transparency_keeps_palette_colors() {
        let bytes = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/palette_trns.png"));

        let rgb = decode_rgb(bytes, "palette_trns.png").unwrap();
        assert_eq!(rgb.dimensions(), (3, 2));
        // index 0 は完全透過、index 1 は半透過
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([10, 20, 30]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([200, 100, 50]));
        assert_eq!(*rgb.get_pixel(2, 0), Rgb([0, 255, 0]));
        assert_eq!(*rgb.get_pixel(0, 1), Rgb([0, 255, 0]));
    }

    fn avif_bytes(img: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img.clone()).write_to(&mut buf, ImageFormat::Avif).unwrap();
        buf.into_inner()
    }

    #[cfg(not(feature = "avif"))]
    #[test]
    fn test_avif_without_feature_is_decode_error() {
        let bytes = avif_bytes(&RgbImage::from_pixel(16, 8, Rgb([40, 160, 220])));

        let err = decode_rgb(&bytes, "frame.avif").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[cfg(feature = "avif")]
    #[test]
    fn test_avif_file_decodes_to_rgb() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame.avif");
        std::fs::write(&path, avif_bytes(&RgbImage::from_pixel(16, 8, Rgb([40, 160, 220])))).unwrap();

        let rgb = load_rgb_image(&path).unwrap();
        assert_eq!(rgb.dimensions(), (16, 8));
        let Rgb([r, g, b]) = *rgb.get_pixel(8, 4);
        // 非可逆圧縮なので近い値であればよい
        assert!(r.abs_diff(40) <= 10 && g.abs_diff(160) <= 10 && b.abs_diff(220) <= 10);
    }

    #[test]
    fn test_garbage_bytes_fail_with_decode_error() {
        let err = decode_rgb(b"definitely not an image", "garbage").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = load_rgb_image(Path::new("no/such/image.png")).unwrap_err();
        assert!(err.is_missing_file());
    }

    #[test]
    fn test_data_url_roundtrip() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])));
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(&img));

        let with_header = decode_data_url(&format!("data:image/png;base64,{encoded}")).unwrap();
        let bare = decode_data_url(&encoded).unwrap();

        assert_eq!(with_header.dimensions(), (3, 2));
        assert_eq!(with_header, bare);
    }

    #[test]
    fn test_data_url_requires_base64() {
        let err = decode_data_url("data:image/png,raw").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
