pub mod detector;
pub mod error;
pub mod postprocess;
pub mod predictor;
pub mod preprocess;
pub mod prompt;
pub mod request;

pub use error::Result;
