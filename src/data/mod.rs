//! Data loading for landmark-conditioned face translation.
//!
//! File lists name images, their landmark annotations and domain labels.
//! Loaders decode, augment and batch them into candle tensors.

pub mod factory;
pub mod landmarks;
pub mod list;
pub mod loader;
pub mod transform;

pub use factory::{
    build_loaders, get_test_loader, get_test_loader_vgg, get_train_loader, get_train_loader_vgg, Loaders,
};
pub use landmarks::{load_landmarks, render_heatmap, Landmarks};
pub use list::{read_list, sidecar_landmarks, ListEntry};
pub use loader::{Batch, DataLoader, LoaderSpec, Pipeline};
