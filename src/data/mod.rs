pub mod image_loader;
pub mod image_tensor;
pub mod padding;
pub mod augment;
pub mod transforms;
pub mod dataset;

pub use image_loader::{load_rgb_image, decode_rgb, decode_data_url};
pub use image_tensor::ImageTensor;
pub use padding::{pad_to_square, pad_image_to_square, pad_tensor_to_square, PadInput};
pub use transforms::{inference_pipeline, Pipeline, TransformStep, IMAGENET_MEAN, IMAGENET_STD, INPUT_SIZE};
pub use dataset::{DatasetImage, HandstandDataset, HandstandItem};
