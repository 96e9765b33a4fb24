//! Object store abstraction.
//!
//! The backup engine only ever talks to an [`ObjectStore`]: whole-object
//! put/get for the manifest, ranged reads for restore, and a streaming
//! multipart upload for data files. Two implementations exist: S3
//! (`s3://bucket/prefix`) and the local filesystem (`file:///path`).

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use miette::Result;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;

pub use file::FileBackend;
pub use s3::S3Backend;

pub mod file;
pub mod s3;

/// How many fetched ranges may sit in a [`ObjectStore::get_ranges`] channel
/// before the producer is backpressured.
pub(crate) const RANGE_CHANNEL_DEPTH: usize = 16;

#[derive(Debug, Error, miette::Diagnostic)]
pub enum UrlError {
	#[error("unsupported backup URL {0:?}: expected s3://bucket/prefix or file:///path")]
	Unsupported(String),
	#[error("please provide the full path to the meta object in the backup URL: {0:?}")]
	NotMeta(String),
}

/// A part that finished uploading, in the shape `complete_multipart` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUploadPart {
	pub part_number: i32,
	pub etag: String,
	pub sha1: [u8; 20],
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
	/// SHA-1 hex of the canonical destination, names the local cache slot.
	fn cache_name(&self) -> String;

	/// Upload a whole object from a local file.
	async fn put_object(&self, name: &str, src: &Path) -> Result<()>;

	/// Download a whole object to a local file (which must not exist).
	async fn get_object(&self, name: &str, dst: &Path) -> Result<()>;

	/// Read exactly `size` bytes at `offset` of an object.
	async fn get_range(&self, name: &str, offset: u64, size: u64) -> Result<Bytes>;

	/// Read many `(offset, size)` ranges of one object.
	///
	/// Ranges are fetched in the given order and yielded one [`Bytes`] per
	/// range; consecutive ranges may be coalesced into a single request.
	/// The channel is bounded, so the consumer paces the fetch.
	async fn get_ranges(
		&self,
		name: &str,
		ranges: Vec<(u64, u64)>,
	) -> Result<mpsc::Receiver<Result<Bytes>>>;

	/// List object names starting with `prefix`, sorted.
	async fn list(&self, prefix: &str) -> Result<Vec<String>>;

	/// Begin a multipart upload, returning its upload id.
	async fn create_multipart(&self, name: &str) -> Result<String>;

	/// Upload one part (numbered from 1), returning its etag.
	async fn upload_part(
		&self,
		name: &str,
		upload_id: &str,
		part_number: i32,
		data: Bytes,
		sha1: [u8; 20],
	) -> Result<String>;

	/// Complete a multipart upload. `aggregate_sha1` is the SHA-1 of the
	/// concatenated per-part SHA-1 digests.
	async fn complete_multipart(
		&self,
		name: &str,
		upload_id: &str,
		parts: Vec<CompletedUploadPart>,
		aggregate_sha1: [u8; 20],
	) -> Result<()>;

	/// Abandon a multipart upload.
	async fn abort_multipart(&self, name: &str, upload_id: &str) -> Result<()>;
}

/// Construct a backend for a destination URL.
pub async fn from_url(url: &str, storage_class: Option<String>) -> Result<Arc<dyn ObjectStore>> {
	if url.starts_with("s3://") {
		Ok(Arc::new(S3Backend::new(url, storage_class).await?))
	} else if url.starts_with("file://") {
		Ok(Arc::new(FileBackend::new(url)?))
	} else {
		Err(UrlError::Unsupported(url.into()).into())
	}
}

/// Split a restore URL into the destination URL and the meta object name.
pub fn split_meta_url(url: &str) -> Result<(String, String), UrlError> {
	// UNWRAP: static pattern
	let re = Regex::new(r"^((?:s3|file)://.+)/(baq\.[0-9TZ]+\.meta)$").unwrap();
	let caps = re
		.captures(url)
		.ok_or_else(|| UrlError::NotMeta(url.into()))?;
	Ok((caps[1].to_string(), caps[2].to_string()))
}

/// A run of consecutive ranges that one request can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RangeGroup {
	pub offset: u64,
	pub total: u64,
	pub sizes: Vec<u64>,
}

/// Group `(offset, size)` ranges so that each group covers one contiguous
/// span of the object. Order is preserved; only adjacent entries where one
/// range ends exactly where the next begins are merged.
pub(crate) fn coalesce_ranges(ranges: &[(u64, u64)]) -> Vec<RangeGroup> {
	let mut groups: Vec<RangeGroup> = Vec::new();
	for &(offset, size) in ranges {
		match groups.last_mut() {
			Some(group) if group.offset + group.total == offset => {
				group.total += size;
				group.sizes.push(size);
			}
			_ => groups.push(RangeGroup {
				offset,
				total: size,
				sizes: vec![size],
			}),
		}
	}
	groups
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn consecutive_ranges_coalesce() {
		let groups = coalesce_ranges(&[(0, 10), (10, 5), (15, 1), (100, 4), (104, 6), (200, 1)]);
		assert_eq!(
			groups,
			vec![
				RangeGroup {
					offset: 0,
					total: 16,
					sizes: vec![10, 5, 1]
				},
				RangeGroup {
					offset: 100,
					total: 10,
					sizes: vec![4, 6]
				},
				RangeGroup {
					offset: 200,
					total: 1,
					sizes: vec![1]
				},
			]
		);
	}

	#[test]
	fn gaps_and_overlaps_stay_separate() {
		let groups = coalesce_ranges(&[(0, 10), (9, 10), (30, 2)]);
		assert_eq!(groups.len(), 3);
	}

	#[test]
	fn meta_urls_split() {
		assert_eq!(
			split_meta_url("s3://bucket/some/prefix/baq.20240101T000000Z.meta").unwrap(),
			(
				"s3://bucket/some/prefix".into(),
				"baq.20240101T000000Z.meta".into()
			)
		);
		assert_eq!(
			split_meta_url("file:///var/backups/baq.20240101T000000Z.meta").unwrap(),
			(
				"file:///var/backups".into(),
				"baq.20240101T000000Z.meta".into()
			)
		);
		assert!(split_meta_url("s3://bucket/some/prefix").is_err());
		assert!(split_meta_url("s3://bucket/baq.20240101T000000Z.data-000000").is_err());
	}
}
