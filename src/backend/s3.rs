//! S3 storage backend.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::{
	primitives::ByteStream,
	types::{
		ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart, ObjectCannedAcl, StorageClass,
	},
	Client as S3Client,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use miette::{bail, miette, IntoDiagnostic as _, Result, WrapErr as _};
use regex::Regex;
use tokio::{io::AsyncReadExt as _, sync::mpsc};
use tracing::{debug, info};

use super::{coalesce_ranges, CompletedUploadPart, ObjectStore, UrlError, RANGE_CHANNEL_DEPTH};
use crate::crypto::sha1_hex;

/// Parse `s3://bucket[/prefix]` into bucket and a key prefix that is either
/// empty or ends with a slash.
fn parse_s3_url(url: &str) -> Result<(String, String), UrlError> {
	// UNWRAP: static pattern
	let re = Regex::new(r"^s3://([^/?]+)(?:/([^?]*))?$").unwrap();
	let caps = re
		.captures(url)
		.ok_or_else(|| UrlError::Unsupported(url.into()))?;

	let bucket = caps[1].to_string();
	let prefix = caps.get(2).map_or("", |m| m.as_str()).trim_matches('/');
	let prefix = if prefix.is_empty() {
		String::new()
	} else {
		format!("{prefix}/")
	};
	Ok((bucket, prefix))
}

pub struct S3Backend {
	client: S3Client,
	bucket: String,
	key_prefix: String,
	storage_class: Option<StorageClass>,
}

impl S3Backend {
	pub async fn new(url: &str, storage_class: Option<String>) -> Result<Self> {
		let (bucket, key_prefix) = parse_s3_url(url)?;
		let config = crate::aws::init().await;
		Ok(Self {
			client: S3Client::new(&config),
			bucket,
			key_prefix,
			storage_class: storage_class.map(|class| StorageClass::from(class.as_str())),
		})
	}

	fn key(&self, name: &str) -> String {
		format!("{}{name}", self.key_prefix)
	}

	fn url(&self, name: &str) -> String {
		format!("s3://{}/{}", self.bucket, self.key(name))
	}
}

#[async_trait]
impl ObjectStore for S3Backend {
	fn cache_name(&self) -> String {
		sha1_hex(&format!("s3://{}/{}", self.bucket, self.key_prefix))
	}

	async fn put_object(&self, name: &str, src: &Path) -> Result<()> {
		let body = ByteStream::from_path(src)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("reading {}", src.display()))?;
		let size = tokio::fs::metadata(src).await.into_diagnostic()?.len();

		self.client
			.put_object()
			.bucket(&self.bucket)
			.key(self.key(name))
			.acl(ObjectCannedAcl::Private)
			.set_storage_class(self.storage_class.clone())
			.body(body)
			.send()
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("uploading {}", self.url(name)))?;

		info!(
			"Uploaded file {} ({:.2} MB)",
			self.url(name),
			size as f64 / (1 << 20) as f64
		);
		Ok(())
	}

	async fn get_object(&self, name: &str, dst: &Path) -> Result<()> {
		if dst.exists() {
			bail!("download target {} already exists", dst.display());
		}

		let resp = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(self.key(name))
			.send()
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("downloading {}", self.url(name)))?;

		let mut reader = Box::pin(resp.body.into_async_read());
		let mut file = tokio::fs::File::create(dst).await.into_diagnostic()?;
		let bytes = tokio::io::copy(&mut reader, &mut file)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("writing {}", dst.display()))?;

		info!(
			"Downloaded file {} ({:.2} MB)",
			self.url(name),
			bytes as f64 / (1 << 20) as f64
		);
		Ok(())
	}

	async fn get_range(&self, name: &str, offset: u64, size: u64) -> Result<Bytes> {
		let resp = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(self.key(name))
			.range(format!("bytes={}-{}", offset, offset + size - 1))
			.send()
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("fetching range of {}", self.url(name)))?;

		let data = resp.body.collect().await.into_diagnostic()?.into_bytes();
		if data.len() as u64 != size {
			bail!(
				"short range read from {}: wanted {size} bytes, got {}",
				self.url(name),
				data.len()
			);
		}
		Ok(data)
	}

	async fn get_ranges(
		&self,
		name: &str,
		ranges: Vec<(u64, u64)>,
	) -> Result<mpsc::Receiver<Result<Bytes>>> {
		let (tx, rx) = mpsc::channel(RANGE_CHANNEL_DEPTH);
		let client = self.client.clone();
		let bucket = self.bucket.clone();
		let key = self.key(name);
		let url = self.url(name);

		tokio::spawn(async move {
			let result: Result<()> = async {
				for group in coalesce_ranges(&ranges) {
					debug!(
						offset = group.offset,
						total = group.total,
						ranges = group.sizes.len(),
						"fetching range group from {url}"
					);
					let resp = client
						.get_object()
						.bucket(&bucket)
						.key(&key)
						.range(format!(
							"bytes={}-{}",
							group.offset,
							group.offset + group.total - 1
						))
						.send()
						.await
						.into_diagnostic()
						.wrap_err_with(|| format!("fetching range group of {url}"))?;

					let mut reader = Box::pin(resp.body.into_async_read());
					for size in group.sizes {
						let mut buf = vec![0u8; size as usize];
						reader
							.read_exact(&mut buf)
							.await
							.into_diagnostic()
							.wrap_err_with(|| format!("short range read from {url}"))?;
						if tx.send(Ok(buf.into())).await.is_err() {
							return Ok(());
						}
					}
				}
				Ok(())
			}
			.await;

			if let Err(err) = result {
				let _ = tx.send(Err(err)).await;
			}
		});

		Ok(rx)
	}

	async fn list(&self, prefix: &str) -> Result<Vec<String>> {
		let mut names = Vec::new();
		let mut pages = self
			.client
			.list_objects_v2()
			.bucket(&self.bucket)
			.prefix(self.key(prefix))
			.into_paginator()
			.send();

		while let Some(page) = pages.next().await {
			let page = page.into_diagnostic().wrap_err("listing objects")?;
			for object in page.contents() {
				if let Some(key) = object.key() {
					if let Some(name) = key.strip_prefix(&self.key_prefix) {
						names.push(name.to_string());
					}
				}
			}
		}
		names.sort();
		Ok(names)
	}

	async fn create_multipart(&self, name: &str) -> Result<String> {
		let mp = self
			.client
			.create_multipart_upload()
			.bucket(&self.bucket)
			.key(self.key(name))
			.acl(ObjectCannedAcl::Private)
			.checksum_algorithm(ChecksumAlgorithm::Sha1)
			.set_storage_class(self.storage_class.clone())
			.send()
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("creating multipart upload for {}", self.url(name)))?;

		let Some(upload_id) = mp.upload_id else {
			bail!("No upload ID returned from S3");
		};
		debug!(%name, %upload_id, "created multipart upload");
		Ok(upload_id)
	}

	async fn upload_part(
		&self,
		name: &str,
		upload_id: &str,
		part_number: i32,
		data: Bytes,
		sha1: [u8; 20],
	) -> Result<String> {
		let upload = self
			.client
			.upload_part()
			.bucket(&self.bucket)
			.key(self.key(name))
			.upload_id(upload_id)
			.part_number(part_number)
			.checksum_sha1(BASE64.encode(sha1))
			.body(ByteStream::from(data))
			.send()
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("uploading part {part_number} of {}", self.url(name)))?;

		upload
			.e_tag
			.ok_or_else(|| miette!("No ETag returned for part {part_number} of {name}"))
	}

	async fn complete_multipart(
		&self,
		name: &str,
		upload_id: &str,
		parts: Vec<CompletedUploadPart>,
		aggregate_sha1: [u8; 20],
	) -> Result<()> {
		let parts = parts
			.into_iter()
			.map(|part| {
				CompletedPart::builder()
					.part_number(part.part_number)
					.e_tag(part.etag)
					.checksum_sha1(BASE64.encode(part.sha1))
					.build()
			})
			.collect();

		self.client
			.complete_multipart_upload()
			.bucket(&self.bucket)
			.key(self.key(name))
			.upload_id(upload_id)
			.multipart_upload(
				CompletedMultipartUpload::builder()
					.set_parts(Some(parts))
					.build(),
			)
			.checksum_sha1(BASE64.encode(aggregate_sha1))
			.send()
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("completing multipart upload of {}", self.url(name)))?;

		debug!(%name, "multipart upload completed");
		Ok(())
	}

	async fn abort_multipart(&self, name: &str, upload_id: &str) -> Result<()> {
		self.client
			.abort_multipart_upload()
			.bucket(&self.bucket)
			.key(self.key(name))
			.upload_id(upload_id)
			.send()
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("aborting multipart upload of {}", self.url(name)))?;

		debug!(%name, "multipart upload aborted");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn url_parsing() {
		assert_eq!(
			parse_s3_url("s3://bucket/some/prefix").unwrap(),
			("bucket".into(), "some/prefix/".into())
		);
		assert_eq!(
			parse_s3_url("s3://bucket/some/prefix/").unwrap(),
			("bucket".into(), "some/prefix/".into())
		);
		assert_eq!(
			parse_s3_url("s3://bucket").unwrap(),
			("bucket".into(), String::new())
		);
		assert_eq!(
			parse_s3_url("s3://bucket/").unwrap(),
			("bucket".into(), String::new())
		);
		assert!(parse_s3_url("s3://bucket/prefix?query").is_err());
		assert!(parse_s3_url("http://bucket/prefix").is_err());
	}
}
