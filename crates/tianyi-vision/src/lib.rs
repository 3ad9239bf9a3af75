pub mod describe;
pub mod image_ops;

pub use describe::VisionClient;
pub use image_ops::{normalize_image, save_user_image, VisionError};
