pub mod backend;
pub mod error;
pub mod graph;
pub mod ir;
pub mod ops;
pub mod session;
pub mod shape;
pub mod tensor;

pub use backend::{BackendCapabilities, FeatureLevel};
pub use error::Error;
pub use graph::GraphInfo;
pub use session::device::Device;
pub use session::GraphExecutor;
