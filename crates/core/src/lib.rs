//! sm-core: Core library for browsing and transferring objects in
//! S3-compatible storage
//!
//! This crate provides the parts of an object storage browser that sit
//! between the store and the screen:
//! - A TTL cache of complete listings, warmed by a bucket prefetcher
//! - Lazily paged listing sessions driven by continuation tokens
//! - A bounded-concurrency transfer queue with cancel and retry
//! - A command/event controller for host applications
//!
//! This crate is independent of any specific S3 SDK. The store is consumed
//! through the `ObjectStore` trait; `sm-s3` provides the aws-sdk-s3 adapter.

pub mod browser;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod listing;
pub mod pager;
pub mod prefetch;
pub mod traits;
pub mod transfer;

pub use browser::Browser;
pub use cache::ListingCache;
pub use config::{Config, ConfigManager};
pub use controller::{Command, Controller, Outcome};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus};
pub use listing::{
    Entry, FullListing, ListingPage, Row, display_name, fetch_all_objects, fetch_full_listing,
};
pub use pager::{PageMode, PagerSettings, VirtualPageProvider};
pub use prefetch::PrefetchScheduler;
pub use traits::{
    ByteStream, ListRequest, ListResult, ObjectBody, ObjectInfo, ObjectStore, ProgressFn,
    UploadBody,
};
pub use transfer::{
    Direction, TransferId, TransferQueue, TransferRequest, TransferSnapshot, TransferState,
    UploadPlan, plan_download, plan_folder_download, plan_upload,
};
