pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod services;

pub use error::AdmissionError;
pub use pipeline::{PreparedTask, SubmitRequest, TaskPipeline};
pub use services::Services;
