//! 計算バックエンドとデバイスの選択

use super::config::DeviceType;

/// 推論で使うバックエンド（autodiffなし）
#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn_wgpu::Wgpu;

/// 推論で使うバックエンド（autodiffなし）
#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn_ndarray::NdArray<f32>;

pub type DefaultDevice = <DefaultBackend as burn::tensor::backend::Backend>::Device;

/// 設定に応じたデバイスを返す
#[cfg(feature = "wgpu")]
pub fn select_device(device_type: DeviceType) -> DefaultDevice {
    match device_type {
        DeviceType::Wgpu => burn_wgpu::WgpuDevice::default(),
        DeviceType::Cpu => burn_wgpu::WgpuDevice::Cpu,
    }
}

/// 設定に応じたデバイスを返す
#[cfg(not(feature = "wgpu"))]
pub fn select_device(device_type: DeviceType) -> DefaultDevice {
    if device_type == DeviceType::Wgpu {
        tracing::warn!("wgpu フィーチャーが無効なため CPU (NdArray) を使用します");
    }
    burn_ndarray::NdArrayDevice::Cpu
}
