//! # es-platform
//!
//! A small local stand-in for a serverless GPU platform: a declarative
//! container image, shared file systems and durable volumes mounted into
//! functions, and an executor that runs function calls as tokio tasks under
//! per-function concurrency, GPU and timeout settings.

mod executor;
mod function;
mod image;
mod mounts;

pub use executor::{FunctionContext, GpuSlot, LocalExecutor, MapCall};
pub use function::FunctionSpec;
pub use image::{BuildStep, ImageSpec};
pub use mounts::{Mount, MountKind, MountTable, NetworkFileSystem, Volume};
