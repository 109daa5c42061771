//! Image processing — pure Rust, statically linked.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image::image_dimensions` |
//! | **RAW preview** | custom TIFF IFD walker + JPEG marker scan |
//! | **Resize → JPEG** | Lanczos3 + `JpegEncoder`, atomic rename into place |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: High-level functions combining calculations + backend

pub mod backend;
mod calculations;
pub mod operations;
mod params;
pub(crate) mod raw_preview;
pub mod rust_backend;

pub use backend::{BackendError, Dimensions, ImageBackend};
pub use calculations::{calculate_fit_dimensions, needs_resize};
pub use operations::{GeneratedPreview, create_preview, get_dimensions};
pub use params::{Quality, ResizeParams, SourceFormat};
pub use rust_backend::RustBackend;
