//! sm-s3: aws-sdk-s3 adapter for sm-core
//!
//! Implements the `ObjectStore` trait on top of aws-sdk-s3, so the same
//! client works with AWS and with S3-compatible servers.

mod client;

pub use client::{ConnectionConfig, MAX_PARTS, MIN_PART_SIZE, S3Client, classify_error};
