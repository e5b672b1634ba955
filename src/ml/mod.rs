pub mod architecture;
pub mod export;
pub mod inference;
pub mod layers;
pub mod ml_model;
pub mod onnx;
pub mod resnet;

pub use architecture::{Architecture, LoadedModel, DEFAULT_ARCHITECTURE, REGISTRY};
pub use export::{build_onnx_model, export_onnx, ExportOptions};
pub use inference::{predict, predict_image, InferenceEngine, Prediction};
pub use ml_model::{SimpleCnn, SimpleCnnConfig};
pub use resnet::{ResNet, ResNetConfig};
