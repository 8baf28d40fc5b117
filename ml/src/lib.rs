pub mod data;
pub mod error;
pub mod inference;
pub mod model;
pub mod preprocess;
pub mod report;
pub mod scaler;
pub mod sequence;
pub mod training;

pub use error::{EncodeError, Error, Result};
pub use sequence::{encode, Sequence, DEFAULT_SEQ_LEN};
