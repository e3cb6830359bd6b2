pub mod config;
pub mod errors;
pub mod operations;
pub mod space;
pub mod workload;

pub use config::*;
pub use errors::*;
pub use operations::*;
pub use space::*;
pub use workload::*;
