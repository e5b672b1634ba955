//! ホスト側のCHW画像テンソル

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::RgbImage;

use crate::error::{Error, Result};

/// (C, H, W) の順で平坦化された f32 画像データ
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    shape: [usize; 3],
}

impl ImageTensor {
    pub fn new(data: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(Error::InvalidInput(format!(
                "tensor data has {} values, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// 全要素を `value` で埋めたテンソル
    pub fn full(shape: [usize; 3], value: f32) -> Self {
        Self {
            data: vec![value; shape.iter().product()],
            shape,
        }
    }

    /// RGB画像を `/255` して [0, 1] のCHWテンソルに変換
    pub fn from_rgb_unit(img: &RgbImage) -> Self {
        let (width, height) = img.dimensions();
        let (w, h) = (width as usize, height as usize);
        let mut data = vec![0.0f32; 3 * h * w];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = y as usize * w + x as usize;
            for channel in 0..3 {
                data[channel * h * w + offset] = pixel[channel] as f32 / 255.0;
            }
        }

        Self {
            data,
            shape: [3, h, w],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// (c, y, x) の値
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.shape[1] + y) * self.shape[2] + x]
    }

    /// Burnテンソル [C, H, W] に変換
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(self.data.clone(), self.shape), device)
    }

    /// バッチ次元を付けたBurnテンソル [1, C, H, W] に変換
    pub fn to_batch<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        self.to_tensor::<B>(device).unsqueeze::<4>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_from_rgb_is_channel_first() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 51]));
        img.put_pixel(1, 0, Rgb([0, 255, 102]));

        let t = ImageTensor::from_rgb_unit(&img);
        assert_eq!(t.shape(), [3, 1, 2]);
        assert_eq!(t.get(0, 0, 0), 1.0);
        assert_eq!(t.get(1, 0, 1), 1.0);
        assert!((t.get(2, 0, 0) - 0.2).abs() < 1e-6);
        assert!((t.get(2, 0, 1) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(ImageTensor::new(vec![0.0; 5], [3, 1, 2]).is_err());
        assert!(ImageTensor::new(vec![0.0; 6], [3, 1, 2]).is_ok());
    }
}
