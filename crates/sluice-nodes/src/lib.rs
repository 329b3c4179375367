pub mod builtin;
pub mod registry;
pub mod sandbox;

pub use registry::ExecutorRegistry;
pub use sandbox::SubprocessRunner;
