//! Data-file aggregator.
//!
//! Encrypted blocks of arbitrary size are packed into logical "data files",
//! each materialized as one multipart upload. [`DataCollector::store_block`]
//! returns the `(object name, offset)` address of the block so the manifest
//! can point back into the object later. When a data file would grow past
//! the size cap it is sealed and a new one is opened; sealing and part
//! uploads continue in background tasks so the producer keeps moving.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use miette::{miette, IntoDiagnostic as _, Result};
use sha1::{Digest as _, Sha1};
use tokio::{
	sync::{watch, Semaphore},
	task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
	backend::{CompletedUploadPart, ObjectStore},
	backup::BackupConfig,
	manifest::data_object_name,
};

/// Concurrent part uploads across the whole collector.
const UPLOAD_WORKERS: usize = 8;

/// How many scheduled parts may wait for an upload slot before the producer
/// blocks. Bounds memory to roughly this many part buffers.
const PENDING_PARTS: usize = 3;

pub struct DataCollector {
	backend: Arc<dyn ObjectStore>,
	backup_id: String,
	data_file_size: u64,
	part_size: usize,
	next_file_number: u64,
	current: Option<DataFileWriter>,
	closing: Vec<JoinHandle<Result<()>>>,
	create_gate: Arc<Semaphore>,
	upload_slots: Arc<Semaphore>,
}

impl DataCollector {
	pub fn new(backend: Arc<dyn ObjectStore>, backup_id: &str, config: &BackupConfig) -> Self {
		Self {
			backend,
			backup_id: backup_id.to_string(),
			data_file_size: config.data_file_size,
			part_size: config.part_size,
			next_file_number: 0,
			current: None,
			closing: Vec::new(),
			// creates are serialized so rollover cannot stampede the store
			create_gate: Arc::new(Semaphore::new(1)),
			upload_slots: Arc::new(Semaphore::new(UPLOAD_WORKERS)),
		}
	}

	/// Append a block to the current data file, returning the object name
	/// and the byte offset the block starts at.
	pub async fn store_block(&mut self, data: Bytes) -> Result<(String, u64)> {
		if self.current.is_none() {
			let name = data_object_name(&self.backup_id, self.next_file_number);
			self.next_file_number += 1;
			self.current = Some(DataFileWriter::open(
				Arc::clone(&self.backend),
				name,
				self.part_size,
				Arc::clone(&self.create_gate),
				Arc::clone(&self.upload_slots),
			));
		}

		// UNWRAP: just ensured above
		let file = self.current.as_mut().unwrap();
		let name = file.name.clone();
		let offset = file.offset;
		let size = data.len() as u64;
		file.write(data).await?;

		if offset + size >= self.data_file_size {
			// seal this data file; completion runs in the background while
			// the next block opens a fresh one
			// UNWRAP: current was filled above
			let file = self.current.take().unwrap();
			self.closing.push(file.finish());
		}

		Ok((name, offset))
	}

	/// Seal the current data file and wait for every data file of this
	/// backup to finish uploading.
	pub async fn close(&mut self) -> Result<()> {
		if let Some(file) = self.current.take() {
			self.closing.push(file.finish());
		}

		let mut result = Ok(());
		for handle in self.closing.drain(..) {
			match handle.await.into_diagnostic() {
				Ok(Ok(())) => {}
				Ok(Err(err)) | Err(err) => {
					if result.is_ok() {
						result = Err(err);
					}
				}
			}
		}
		result
	}

	/// Tear down after a failed backup: abort the open data file's upload
	/// and let already-sealed files run to their own conclusion.
	pub async fn abort(&mut self) {
		if let Some(mut file) = self.current.take() {
			file.abort().await;
		}
		for handle in self.closing.drain(..) {
			let _ = handle.await;
		}
	}
}

struct DataFileWriter {
	backend: Arc<dyn ObjectStore>,
	name: String,
	offset: u64,
	part_size: usize,
	part_buffer: BytesMut,
	parts: Vec<JoinHandle<Result<CompletedUploadPart>>>,
	create: Option<JoinHandle<Result<()>>>,
	upload_id: watch::Receiver<Option<String>>,
	pending_gate: Arc<Semaphore>,
	upload_slots: Arc<Semaphore>,
}

impl DataFileWriter {
	fn open(
		backend: Arc<dyn ObjectStore>,
		name: String,
		part_size: usize,
		create_gate: Arc<Semaphore>,
		upload_slots: Arc<Semaphore>,
	) -> Self {
		let (id_tx, id_rx) = watch::channel(None);
		let create = tokio::spawn({
			let backend = Arc::clone(&backend);
			let name = name.clone();
			async move {
				let _gate = create_gate.acquire_owned().await.into_diagnostic()?;
				let id = backend.create_multipart(&name).await?;
				// receivers may be gone if the upload was aborted early
				let _ = id_tx.send(Some(id));
				Ok(())
			}
		});

		Self {
			backend,
			name,
			offset: 0,
			part_size,
			part_buffer: BytesMut::new(),
			parts: Vec::new(),
			create: Some(create),
			upload_id: id_rx,
			pending_gate: Arc::new(Semaphore::new(PENDING_PARTS)),
			upload_slots,
		}
	}

	async fn write(&mut self, data: Bytes) -> Result<()> {
		self.part_buffer.extend_from_slice(&data);
		self.offset += data.len() as u64;
		if self.part_buffer.len() >= self.part_size {
			let part = self.part_buffer.split().freeze();
			self.schedule_part(part).await?;
		}
		Ok(())
	}

	/// Hand one part to the upload pool. Part numbers are assigned here, in
	/// producer order, so completion can list them 1..=n.
	async fn schedule_part(&mut self, part: Bytes) -> Result<()> {
		let pending = Arc::clone(&self.pending_gate)
			.acquire_owned()
			.await
			.into_diagnostic()?;

		let part_number = (self.parts.len() + 1) as i32;
		let backend = Arc::clone(&self.backend);
		let name = self.name.clone();
		let slots = Arc::clone(&self.upload_slots);
		let mut id_rx = self.upload_id.clone();

		self.parts.push(tokio::spawn(async move {
			let _slot = slots.acquire_owned().await.into_diagnostic()?;
			drop(pending);

			let upload_id = {
				let id = id_rx
					.wait_for(Option::is_some)
					.await
					.map_err(|_| miette!("multipart upload of {name} was never created"))?;
				id.as_ref().cloned().expect("BUG: wait_for guarantees Some")
			};

			let sha1: [u8; 20] = Sha1::digest(&part).into();
			debug!(%name, part_number, bytes = part.len(), "uploading data file part");
			let etag = backend
				.upload_part(&name, &upload_id, part_number, part, sha1)
				.await?;

			Ok(CompletedUploadPart {
				part_number,
				etag,
				sha1,
			})
		}));

		Ok(())
	}

	/// Flush the trailing partial part and complete the upload, in the
	/// background. Completion failure aborts the upload before surfacing.
	fn finish(mut self) -> JoinHandle<Result<()>> {
		tokio::spawn(async move {
			match self.complete().await {
				Ok(()) => Ok(()),
				Err(err) => {
					warn!("completing data file {} failed: {err}", self.name);
					self.abort().await;
					Err(err)
				}
			}
		})
	}

	async fn complete(&mut self) -> Result<()> {
		if !self.part_buffer.is_empty() {
			let part = self.part_buffer.split().freeze();
			self.schedule_part(part).await?;
		}

		if let Some(create) = self.create.take() {
			create.await.into_diagnostic()??;
		}

		let mut completed = Vec::with_capacity(self.parts.len());
		for handle in self.parts.drain(..) {
			completed.push(handle.await.into_diagnostic()??);
		}

		let mut concat = Sha1::new();
		for part in &completed {
			concat.update(part.sha1);
		}
		let aggregate: [u8; 20] = concat.finalize().into();

		let upload_id = self
			.upload_id
			.borrow()
			.as_ref()
			.cloned()
			.ok_or_else(|| miette!("no upload id for {}", self.name))?;

		debug!(name = %self.name, parts = completed.len(), "completing data file");
		self.backend
			.complete_multipart(&self.name, &upload_id, completed, aggregate)
			.await
	}

	async fn abort(&mut self) {
		if let Some(create) = self.create.take() {
			create.abort();
			let _ = create.await;
		}
		for handle in self.parts.drain(..) {
			handle.abort();
			let _ = handle.await;
		}

		let upload_id = self.upload_id.borrow().as_ref().cloned();
		if let Some(id) = upload_id {
			if let Err(err) = self.backend.abort_multipart(&self.name, &id).await {
				warn!("failed to abort upload of {}: {err}", self.name);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::FileBackend;

	fn config(part_size: usize, data_file_size: u64) -> BackupConfig {
		BackupConfig {
			part_size,
			data_file_size,
			..BackupConfig::default()
		}
	}

	fn store(dir: &std::path::Path) -> Arc<dyn ObjectStore> {
		Arc::new(FileBackend::new(&format!("file://{}", dir.display())).unwrap())
	}

	#[tokio::test]
	async fn blocks_pack_into_one_object() {
		let dir = tempfile::tempdir().unwrap();
		let mut collector = DataCollector::new(store(dir.path()), "20240101T000000Z", &config(8, 1 << 30));

		let mut expected = Vec::new();
		let mut offset = 0;
		for chunk in [&b"abcde"[..], b"fgh", b"ijklmnopq", b"r"] {
			let (name, at) = collector.store_block(Bytes::copy_from_slice(chunk)).await.unwrap();
			assert_eq!(name, "baq.20240101T000000Z.data-000000");
			assert_eq!(at, offset);
			offset += chunk.len() as u64;
			expected.extend_from_slice(chunk);
		}
		collector.close().await.unwrap();

		let stored = std::fs::read(dir.path().join("baq.20240101T000000Z.data-000000")).unwrap();
		assert_eq!(stored, expected);
	}

	#[tokio::test]
	async fn data_files_roll_over_at_the_cap() {
		let dir = tempfile::tempdir().unwrap();
		let mut collector = DataCollector::new(store(dir.path()), "20240101T000000Z", &config(4, 10));

		let mut names = Vec::new();
		for _ in 0..4 {
			let (name, _) = collector
				.store_block(Bytes::from_static(b"xxxxxx"))
				.await
				.unwrap();
			names.push(name);
		}
		collector.close().await.unwrap();

		assert_eq!(
			names,
			vec![
				"baq.20240101T000000Z.data-000000",
				"baq.20240101T000000Z.data-000000",
				"baq.20240101T000000Z.data-000001",
				"baq.20240101T000000Z.data-000001",
			]
		);
		assert_eq!(
			std::fs::read(dir.path().join("baq.20240101T000000Z.data-000000"))
				.unwrap()
				.len(),
			12
		);
		assert_eq!(
			std::fs::read(dir.path().join("baq.20240101T000000Z.data-000001"))
				.unwrap()
				.len(),
			12
		);
	}

	#[tokio::test]
	async fn abort_leaves_no_objects() {
		let dir = tempfile::tempdir().unwrap();
		let backend = store(dir.path());
		let mut collector = DataCollector::new(Arc::clone(&backend), "20240101T000000Z", &config(4, 1 << 30));

		collector
			.store_block(Bytes::from_static(b"doomed data"))
			.await
			.unwrap();
		collector.abort().await;

		assert_eq!(backend.list("baq.").await.unwrap(), Vec::<String>::new());
	}
}
