pub mod config;
pub mod errors;
pub mod hyperparams;

pub use config::*;
pub use errors::*;
pub use hyperparams::*;
