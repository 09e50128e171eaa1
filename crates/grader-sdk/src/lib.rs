// grader-sdk: Foundation layer for the grader host.
// This crate has no dependencies on other grader crates and provides the
// tracing abstraction, the child-process runner used to drive the Docker CLI
// and the image reference parser.

pub mod build_constants;
pub mod docker_name;
pub mod process_invoker;
pub mod string_util;
pub mod trace;
pub mod which_util;

// Re-export commonly used items at crate root
pub use build_constants::{GraderPackage, Source};
pub use docker_name::{DockerName, DockerNameError};
pub use process_invoker::{ProcessExitCodeError, ProcessInvoker, ProcessOutput};
pub use string_util::StringUtil;
pub use trace::TraceWriter;
pub use which_util::WhichUtil;
