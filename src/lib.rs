pub mod check;
pub mod clock;
pub mod controller;
pub mod probe;
pub mod runtime;
pub mod server;
pub mod spec;
pub mod status;

// re-export selected public API
pub use controller::PodController;
pub use spec::PodSpec;
