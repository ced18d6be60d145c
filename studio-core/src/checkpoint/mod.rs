pub mod error;
pub mod models;
pub mod store;

pub use error::{CheckpointError, CheckpointResult};
pub use models::{OperationKind, OperationState, OperationStatus, ProjectState};
pub use store::{checkpoint_file_name, CheckpointStore, ProgressUpdate, StageEntry};
