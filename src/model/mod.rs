pub mod config;
pub mod device;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DeviceType};
pub use device::{select_device, DefaultBackend, DefaultDevice};
pub use model_metadata::ModelMetadata;
pub use model_storage::{
    load_model, load_model_resolved, metadata_path_for, resolve_architecture, save_model, ArchitectureSource,
    ResolvedArchitecture,
};
