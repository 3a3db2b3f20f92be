//! Uploads and downloads
//!
//! `TransferQueue` runs transfers under a concurrency limit with progress,
//! cooperative cancellation and retry. `plan_upload`, `plan_download` and
//! `plan_folder_download` turn host selections into requests for it.

mod exec;
mod item;
mod ordering;
mod plan;
mod queue;

pub use exec::content_type_for;
pub use item::{Direction, TransferId, TransferRequest, TransferSnapshot, TransferState};
pub use plan::{UploadPlan, plan_download, plan_folder_download, plan_upload};
pub use queue::TransferQueue;
