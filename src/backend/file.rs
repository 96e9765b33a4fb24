//! Storage backend using normal filesystem files.
//!
//! Objects are plain files under the backend directory. Multipart uploads
//! stage their parts under `.uploads/<id>/` and `complete` splices them
//! together in part order before an atomic rename, so a data file only ever
//! appears whole, like on a real object store.

use std::{
	io::SeekFrom,
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use miette::{bail, IntoDiagnostic as _, Result, WrapErr as _};
use regex::Regex;
use sha1::{Digest as _, Sha1};
use tokio::{
	fs,
	io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _},
	sync::mpsc,
};
use tracing::{debug, info};

use super::{coalesce_ranges, CompletedUploadPart, ObjectStore, UrlError, RANGE_CHANNEL_DEPTH};
use crate::crypto::sha1_hex;

const UPLOADS_DIR: &str = ".uploads";

#[derive(Debug, Clone)]
pub struct FileBackend {
	root: PathBuf,
}

impl FileBackend {
	/// Note: `file://example` means `./example` (a relative path). Pass
	/// `file:///example` to mean `/example`.
	pub fn new(url: &str) -> Result<Self> {
		// UNWRAP: static pattern
		let re = Regex::new(r"^file://([^?]+)$").unwrap();
		let caps = re
			.captures(url)
			.ok_or_else(|| UrlError::Unsupported(url.into()))?;
		let root = PathBuf::from(&caps[1]);

		if !root.is_dir() {
			info!("Creating directory {}", root.display());
			std::fs::create_dir_all(&root)
				.into_diagnostic()
				.wrap_err_with(|| format!("creating backend directory {}", root.display()))?;
		}
		let root = root
			.canonicalize()
			.into_diagnostic()
			.wrap_err("resolving backend directory")?;

		Ok(Self { root })
	}

	fn object_path(&self, name: &str) -> PathBuf {
		self.root.join(name)
	}

	fn upload_dir(&self, upload_id: &str) -> PathBuf {
		self.root.join(UPLOADS_DIR).join(upload_id)
	}

	fn part_path(&self, upload_id: &str, part_number: i32) -> PathBuf {
		self.upload_dir(upload_id).join(format!("part-{part_number:05}"))
	}
}

#[async_trait]
impl ObjectStore for FileBackend {
	fn cache_name(&self) -> String {
		sha1_hex(&self.root.to_string_lossy())
	}

	async fn put_object(&self, name: &str, src: &Path) -> Result<()> {
		let dst = self.object_path(name);
		let bytes = fs::copy(src, &dst)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("storing object {name}"))?;
		info!(
			"Uploaded file {} ({:.2} MB)",
			dst.display(),
			bytes as f64 / (1 << 20) as f64
		);
		Ok(())
	}

	async fn get_object(&self, name: &str, dst: &Path) -> Result<()> {
		if dst.exists() {
			bail!("download target {} already exists", dst.display());
		}
		fs::copy(self.object_path(name), dst)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("retrieving object {name}"))?;
		Ok(())
	}

	async fn get_range(&self, name: &str, offset: u64, size: u64) -> Result<Bytes> {
		let mut file = fs::File::open(self.object_path(name))
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("opening object {name}"))?;
		file.seek(SeekFrom::Start(offset)).await.into_diagnostic()?;

		let mut buf = vec![0u8; size as usize];
		file.read_exact(&mut buf)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("reading {size} bytes at {offset} of {name}"))?;
		Ok(buf.into())
	}

	async fn get_ranges(
		&self,
		name: &str,
		ranges: Vec<(u64, u64)>,
	) -> Result<mpsc::Receiver<Result<Bytes>>> {
		let (tx, rx) = mpsc::channel(RANGE_CHANNEL_DEPTH);
		let path = self.object_path(name);
		let name = name.to_string();

		tokio::spawn(async move {
			let result: Result<()> = async {
				let mut file = fs::File::open(&path)
					.await
					.into_diagnostic()
					.wrap_err_with(|| format!("opening object {name}"))?;

				for group in coalesce_ranges(&ranges) {
					debug!(
						offset = group.offset,
						total = group.total,
						ranges = group.sizes.len(),
						"reading range group from {name}"
					);
					file.seek(SeekFrom::Start(group.offset))
						.await
						.into_diagnostic()?;
					for size in group.sizes {
						let mut buf = vec![0u8; size as usize];
						file.read_exact(&mut buf).await.into_diagnostic()?;
						if tx.send(Ok(buf.into())).await.is_err() {
							// receiver went away, nothing more to do
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
		let mut entries = fs::read_dir(&self.root).await.into_diagnostic()?;
		while let Some(entry) = entries.next_entry().await.into_diagnostic()? {
			let name = entry.file_name().to_string_lossy().into_owned();
			if name.starts_with(prefix) {
				names.push(name);
			}
		}
		names.sort();
		Ok(names)
	}

	async fn create_multipart(&self, name: &str) -> Result<String> {
		let upload_id = hex::encode(rand::random::<[u8; 8]>());
		fs::create_dir_all(self.upload_dir(&upload_id))
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("creating upload staging for {name}"))?;
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
		let digest: [u8; 20] = Sha1::digest(&data).into();
		if digest != sha1 {
			bail!("part {part_number} of {name} does not match its checksum");
		}

		fs::write(self.part_path(upload_id, part_number), &data)
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("writing part {part_number} of {name}"))?;
		debug!(%name, part_number, bytes = data.len(), "stored part");
		Ok(hex::encode(digest))
	}

	async fn complete_multipart(
		&self,
		name: &str,
		upload_id: &str,
		parts: Vec<CompletedUploadPart>,
		aggregate_sha1: [u8; 20],
	) -> Result<()> {
		let mut concat = Sha1::new();
		for part in &parts {
			concat.update(part.sha1);
		}
		let expected: [u8; 20] = concat.finalize().into();
		if expected != aggregate_sha1 {
			bail!("aggregate checksum mismatch completing {name}");
		}

		let staging = self.upload_dir(upload_id);
		let assembled = staging.join("assembled");
		let mut out = fs::File::create(&assembled).await.into_diagnostic()?;

		for part in &parts {
			let mut hasher = Sha1::new();
			let mut file = fs::File::open(self.part_path(upload_id, part.part_number))
				.await
				.into_diagnostic()
				.wrap_err_with(|| {
					format!("part {} of {name} was never uploaded", part.part_number)
				})?;
			let mut buf = vec![0u8; 64 * 1024];
			loop {
				let n = file.read(&mut buf).await.into_diagnostic()?;
				if n == 0 {
					break;
				}
				hasher.update(&buf[..n]);
				out.write_all(&buf[..n]).await.into_diagnostic()?;
			}
			let digest: [u8; 20] = hasher.finalize().into();
			if digest != part.sha1 {
				bail!("part {} of {name} changed after upload", part.part_number);
			}
		}
		out.flush().await.into_diagnostic()?;
		drop(out);

		fs::rename(&assembled, self.object_path(name))
			.await
			.into_diagnostic()
			.wrap_err_with(|| format!("finalizing object {name}"))?;
		fs::remove_dir_all(&staging).await.into_diagnostic()?;
		debug!(%name, parts = parts.len(), "multipart upload completed");
		Ok(())
	}

	async fn abort_multipart(&self, name: &str, upload_id: &str) -> Result<()> {
		match fs::remove_dir_all(self.upload_dir(upload_id)).await {
			Ok(()) => {
				debug!(%name, %upload_id, "multipart upload aborted");
				Ok(())
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err).into_diagnostic(),
		}
	}
}
