//! Backup driver.
//!
//! Walks the source tree in sorted order, records entry metadata into the
//! manifest, and runs every regular file through a four-stage pipeline:
//! read → whole-file SHA-1 / per-block SHA3-512 → zstd+AES → store. Blocks
//! whose content address is already known (from the previous backup's
//! manifest or from earlier in this one) are not uploaded again; their
//! manifest record points at the original stored location, keyed with the
//! AES key that encrypted them back then.

use std::{
	collections::HashMap,
	num::NonZeroUsize,
	os::unix::fs::{FileTypeExt as _, MetadataExt as _},
	path::{Path, PathBuf},
	sync::{Arc, Mutex as StdMutex},
};

use age::Recipient;
use bytes::Bytes;
use miette::{bail, miette, IntoDiagnostic as _, Result, WrapErr as _};
use nix::unistd::{Gid, Group, Uid, User};
use sha1::{Digest as _, Sha1};
use tokio::{
	io::AsyncReadExt as _,
	sync::{mpsc, oneshot, Mutex as TokioMutex},
	task,
};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::{
	actions::Context,
	backend::ObjectStore,
	collector::DataCollector,
	crypto::{self, BlockId},
	envelope,
	manifest::{
		backup_id_now, meta_object_name, BackupMeta, EntryMeta, FileData, FileSummary, Header,
		MetaWriter, Record, FORMAT_VERSION,
	},
};

/// Block size used when there is no previous backup to inherit one from.
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;

const ZSTD_LEVEL: i32 = 9;
const HASH_QUEUE_DEPTH: usize = 10;

/// Tunables threaded through the whole backup; tests shrink these to
/// exercise part and data-file rollover with small inputs.
#[derive(Debug, Clone)]
pub struct BackupConfig {
	pub block_size: u64,
	pub cache_dir: PathBuf,
	pub workers: usize,
	pub data_file_size: u64,
	pub part_size: usize,
}

impl Default for BackupConfig {
	fn default() -> Self {
		Self {
			block_size: DEFAULT_BLOCK_SIZE,
			cache_dir: default_cache_dir(),
			workers: std::thread::available_parallelism()
				.map(NonZeroUsize::get)
				.unwrap_or(4),
			data_file_size: 100 << 30,
			part_size: 100 << 20,
		}
	}
}

pub fn default_cache_dir() -> PathBuf {
	dirs::cache_dir()
		.unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".cache"))
		.join("baq")
}

/// Back up `local_path` (a directory tree, a single file, or a block
/// device) to `backend`, enveloping the manifest for `recipients`.
#[instrument(skip_all, fields(path = %local_path.display()))]
pub async fn do_backup(
	ctx: Context,
	local_path: &Path,
	backend: Arc<dyn ObjectStore>,
	recipients: &[Box<dyn Recipient + Send>],
	config: BackupConfig,
) -> Result<()> {
	if !local_path.exists() {
		bail!("backup source {} does not exist", local_path.display());
	}

	let temp_dir = tempfile::Builder::new()
		.prefix("baq.")
		.tempdir()
		.into_diagnostic()
		.wrap_err("creating temporary directory")?;
	info!("Backing up {}", local_path.display());

	let cache_meta_path = config.cache_dir.join(backend.cache_name()).join("last-meta");
	let prior = if cache_meta_path.is_file() {
		let path = cache_meta_path.clone();
		Some(Arc::new(
			task::spawn_blocking(move || BackupMeta::read(&path))
				.await
				.into_diagnostic()?
				.wrap_err("loading previous backup metadata")?,
		))
	} else {
		None
	};

	// identical bytes must produce identical blocks across backups, so the
	// previous backup's block size wins over configuration
	let block_size = prior.as_ref().map_or(config.block_size, |p| p.block_size);

	let st = std::fs::metadata(local_path)
		.into_diagnostic()
		.wrap_err_with(|| format!("reading metadata of {}", local_path.display()))?;
	let single_file = if st.file_type().is_block_device() || st.file_type().is_file() {
		// the restore side may then write to a specific path, like an LVM
		// volume, instead of into a directory
		true
	} else if st.file_type().is_dir() {
		false
	} else {
		bail!("Unsupported file type: {}", local_path.display());
	};

	let backup_id = backup_id_now();
	let temp_meta_path = temp_dir.path().join("meta.wip");

	let mut driver = BackupDriver {
		ctx,
		collector: DataCollector::new(Arc::clone(&backend), &backup_id, &config),
		meta: MetaWriter::create(&temp_meta_path)?,
		prior,
		index: Arc::new(StdMutex::new(HashMap::new())),
		block_size,
		workers: config.workers.max(1),
	};

	driver.meta.write(&Record::Header(Header {
		format_version: FORMAT_VERSION,
		backup_id: backup_id.clone(),
		block_size,
		single_file,
	}))?;

	match driver.backup_entries(local_path, single_file).await {
		Err(err) => {
			driver.collector.abort().await;
			Err(err)
		}
		Ok(()) => {
			driver.collector.close().await?;
			driver.meta.finish()?;

			let enveloped_path = temp_dir.path().join("meta.wip.age");
			envelope::encrypt_file(&temp_meta_path, &enveloped_path, recipients).await?;
			backend
				.put_object(&meta_object_name(&backup_id), &enveloped_path)
				.await?;

			store_cache_meta(&temp_meta_path, &cache_meta_path)?;
			info!("Backup {backup_id} finished");
			Ok(())
		}
	}
}

/// Keep the plaintext manifest as the dedup seed for the next backup.
fn store_cache_meta(temp_meta_path: &Path, cache_meta_path: &Path) -> Result<()> {
	// UNWRAP: the cache path always has a parent directory
	let parent = cache_meta_path.parent().unwrap();
	if !parent.is_dir() {
		debug!("Creating directory {}", parent.display());
		std::fs::create_dir_all(parent).into_diagnostic()?;
	}

	if cache_meta_path.exists() {
		std::fs::remove_file(cache_meta_path).into_diagnostic()?;
	}
	if std::fs::rename(temp_meta_path, cache_meta_path).is_err() {
		// the temp dir may be on another filesystem
		std::fs::copy(temp_meta_path, cache_meta_path).into_diagnostic()?;
	}
	debug!("Metadata file stored in {}", cache_meta_path.display());
	Ok(())
}

/// What the compress/encrypt stage resolved one block to.
enum BlockOutcome {
	/// Already stored, by a previous backup or earlier in this one.
	Reused(FileData),
	/// Fresh content, compressed and encrypted under the current file key.
	New { sha3: BlockId, encrypted: Bytes },
}

type EncryptJob = (Bytes, oneshot::Sender<BlockOutcome>);
type StoreJob = (u64, u64, oneshot::Receiver<BlockOutcome>);

struct BackupDriver {
	ctx: Context,
	collector: DataCollector,
	meta: MetaWriter,
	prior: Option<Arc<BackupMeta>>,
	index: Arc<StdMutex<HashMap<BlockId, FileData>>>,
	block_size: u64,
	workers: usize,
}

impl BackupDriver {
	async fn backup_entries(&mut self, root: &Path, single_file: bool) -> Result<()> {
		if single_file {
			let st = std::fs::metadata(root).into_diagnostic()?;
			// in single-file mode the recorded path is the full source path;
			// restore only uses its file name, if that
			self.meta.write(&Record::File(entry_meta(
				&st,
				root.to_string_lossy().into_owned(),
			)))?;
			self.backup_file_contents(root, st.len()).await?;
			if st.file_type().is_file() {
				self.warn_if_changed(root, &st);
			}
			return Ok(());
		}

		for entry in WalkDir::new(root)
			.min_depth(1)
			.follow_links(true)
			.sort_by_file_name()
		{
			let entry = entry.into_diagnostic().wrap_err("walking source tree")?;
			let path = entry.path();
			let relative = path
				.strip_prefix(root)
				.expect("BUG: walker stays under the root")
				.to_string_lossy()
				.into_owned();
			let file_type = entry.file_type();

			if file_type.is_fifo() {
				info!("Skipping {relative} - unsupported file type (fifo)");
				continue;
			} else if file_type.is_socket() {
				info!("Skipping {relative} - unsupported file type (socket)");
				continue;
			} else if file_type.is_char_device() {
				info!("Skipping {relative} - unsupported file type (char device)");
				continue;
			}

			if entry.path_is_symlink() {
				// the target's bytes are what we back up, same as rsync's
				// --copy-links
				info!("Dereferencing symlink {relative}");
			}

			let st = entry.metadata().into_diagnostic().wrap_err_with(|| {
				format!("reading metadata of {}", path.display())
			})?;

			if file_type.is_dir() {
				debug!("Processing directory {relative}");
				self.meta
					.write(&Record::Directory(entry_meta(&st, relative)))?;
			} else if file_type.is_block_device() {
				info!("Skipping {relative} - unsupported file type (block device)");
			} else if file_type.is_file() {
				debug!("Processing file {relative}");
				self.meta.write(&Record::File(entry_meta(&st, relative)))?;
				self.backup_file_contents(path, st.len()).await?;
				self.warn_if_changed(path, &st);
			} else {
				info!("Skipping {relative} - unsupported file type");
			}
		}

		Ok(())
	}

	fn warn_if_changed(&self, path: &Path, before: &std::fs::Metadata) {
		let unchanged = std::fs::metadata(path).is_ok_and(|after| {
			(timestamp_ns(before.mtime(), before.mtime_nsec()), before.len())
				== (timestamp_ns(after.mtime(), after.mtime_nsec()), after.len())
		});
		if !unchanged {
			info!("File has changed while being backed up: {}", path.display());
		}
	}

	/// Run one file through the backup pipeline.
	///
	/// The reader and the hash/encrypt workers are spawned tasks connected
	/// by bounded channels; this method itself plays the storer so that
	/// `file_data` records land in the manifest in file offset order.
	#[instrument(skip_all, fields(path = %path.display()))]
	async fn backup_file_contents(&mut self, path: &Path, expected_len: u64) -> Result<()> {
		let aes_key = crypto::generate_key();
		let block_size = self.block_size as usize;

		let (hash_tx, mut hash_rx) = mpsc::channel::<Bytes>(HASH_QUEUE_DEPTH);
		let (encrypt_tx, encrypt_rx) = mpsc::channel::<EncryptJob>(self.workers + 10);
		let (store_tx, store_rx) = mpsc::channel::<StoreJob>(self.workers + 10);

		let reader = tokio::spawn({
			let path = path.to_path_buf();
			async move {
				let mut file = tokio::fs::File::open(&path)
					.await
					.into_diagnostic()
					.wrap_err_with(|| format!("opening {}", path.display()))?;
				let mut bytes_read = 0u64;
				let mut file_offset = 0u64;

				loop {
					let mut buf = vec![0u8; block_size];
					let mut filled = 0;
					while filled < block_size {
						let n = file
							.read(&mut buf[filled..])
							.await
							.into_diagnostic()
							.wrap_err_with(|| format!("reading {}", path.display()))?;
						if n == 0 {
							break;
						}
						filled += n;
					}
					if filled == 0 {
						break;
					}
					buf.truncate(filled);

					let block = Bytes::from(buf);
					bytes_read += block.len() as u64;
					let (done_tx, done_rx) = oneshot::channel();

					// a closed queue means that stage failed; its own error
					// is what gets surfaced
					if hash_tx.send(block.clone()).await.is_err() {
						break;
					}
					if encrypt_tx.send((block.clone(), done_tx)).await.is_err() {
						break;
					}
					if store_tx
						.send((file_offset, block.len() as u64, done_rx))
						.await
						.is_err()
					{
						break;
					}
					file_offset += block.len() as u64;
				}

				Ok::<_, miette::Report>(bytes_read)
			}
		});

		let hasher = tokio::spawn(async move {
			let mut sha1 = Sha1::new();
			while let Some(block) = hash_rx.recv().await {
				sha1.update(&block);
			}
			let digest: [u8; 20] = sha1.finalize().into();
			digest
		});

		let encrypt_rx = Arc::new(TokioMutex::new(encrypt_rx));
		let mut encrypt_workers = Vec::with_capacity(self.workers);
		for _ in 0..self.workers {
			let rx = Arc::clone(&encrypt_rx);
			let prior = self.prior.clone();
			let index = Arc::clone(&self.index);
			encrypt_workers.push(tokio::spawn(async move {
				loop {
					let job = rx.lock().await.recv().await;
					let Some((block, done)) = job else {
						break;
					};

					let prior = prior.clone();
					let index = Arc::clone(&index);
					let outcome = task::spawn_blocking(move || {
						let sha3 = crypto::block_id(&block);
						let existing = prior
							.as_ref()
							.and_then(|p| p.get_block(&sha3).cloned())
							.or_else(|| {
								index
									.lock()
									.expect("BUG: dedup index mutex poisoned")
									.get(&sha3)
									.cloned()
							});
						if let Some(existing) = existing {
							return Ok(BlockOutcome::Reused(existing));
						}

						let compressed = zstd::stream::encode_all(&block[..], ZSTD_LEVEL)
							.into_diagnostic()
							.wrap_err("compressing block")?;
						let encrypted = crypto::encrypt_aes(&compressed, &aes_key);
						Ok::<_, miette::Report>(BlockOutcome::New {
							sha3,
							encrypted: encrypted.into(),
						})
					})
					.await
					.into_diagnostic()??;

					// the storer going away is handled via its own error
					let _ = done.send(outcome);
				}
				Ok::<_, miette::Report>(())
			}));
		}

		let progress = self.ctx.data_bar(expected_len);
		progress.set_message(path.display().to_string());
		let store_result = self.store_blocks(store_rx, &aes_key, &progress).await;
		progress.finish_and_clear();
		self.ctx.progress.remove(&progress);

		let bytes_read = reader.await.into_diagnostic()??;
		for worker in encrypt_workers {
			worker.await.into_diagnostic()??;
		}
		let whole_file_sha1 = hasher.await.into_diagnostic()?;
		let (compressed_size, reused_blocks, new_blocks) = store_result?;
		debug!(reused_blocks, new_blocks, "file content stored");

		self.meta.write(&Record::FileSummary(FileSummary {
			size: bytes_read,
			compressed_size,
			compression_ratio: if bytes_read > 0 {
				round3(compressed_size as f64 / bytes_read as f64)
			} else {
				0.0
			},
			sha1: whole_file_sha1,
		}))?;

		Ok(())
	}

	/// Consume the store queue in reader order, writing one `file_data`
	/// record per block and uploading the blocks nobody has stored yet.
	async fn store_blocks(
		&mut self,
		mut store_rx: mpsc::Receiver<StoreJob>,
		aes_key: &[u8; 32],
		progress: &indicatif::ProgressBar,
	) -> Result<(u64, u64, u64)> {
		let mut compressed_size = 0u64;
		let mut reused_blocks = 0u64;
		let mut new_blocks = 0u64;

		while let Some((offset, size, done_rx)) = store_rx.recv().await {
			let outcome = done_rx
				.await
				.map_err(|_| miette!("block processing stage died"))?;

			match outcome {
				BlockOutcome::Reused(existing) => {
					compressed_size += existing.store_size;
					reused_blocks += 1;
					self.meta.write(&Record::FileData(FileData {
						offset,
						size,
						..existing
					}))?;
				}
				BlockOutcome::New { sha3, encrypted } => {
					// a concurrent worker may have raced us to the same
					// content; check once more before paying for storage
					let existing = self
						.index
						.lock()
						.expect("BUG: dedup index mutex poisoned")
						.get(&sha3)
						.cloned();

					if let Some(existing) = existing {
						compressed_size += existing.store_size;
						reused_blocks += 1;
						self.meta.write(&Record::FileData(FileData {
							offset,
							size,
							..existing
						}))?;
					} else {
						let store_size = encrypted.len() as u64;
						let (store_file, store_offset) =
							self.collector.store_block(encrypted).await?;
						let record = FileData {
							offset,
							size,
							sha3,
							aes_key: *aes_key,
							store_file,
							store_offset,
							store_size,
						};
						self.index
							.lock()
							.expect("BUG: dedup index mutex poisoned")
							.insert(sha3, record.clone());
						self.meta.write(&Record::FileData(record))?;
						compressed_size += store_size;
						new_blocks += 1;
					}
				}
			}
			progress.inc(size);
		}

		Ok((compressed_size, reused_blocks, new_blocks))
	}
}

fn timestamp_ns(secs: i64, nanos: i64) -> i64 {
	secs * 1_000_000_000 + nanos
}

fn entry_meta(st: &std::fs::Metadata, path: String) -> EntryMeta {
	EntryMeta {
		path,
		st_mtime_ns: timestamp_ns(st.mtime(), st.mtime_nsec()),
		st_atime_ns: timestamp_ns(st.atime(), st.atime_nsec()),
		st_ctime_ns: timestamp_ns(st.ctime(), st.ctime_nsec()),
		st_uid: st.uid(),
		st_gid: st.gid(),
		st_mode: st.mode(),
		owner: User::from_uid(Uid::from_raw(st.uid()))
			.ok()
			.flatten()
			.map(|user| user.name),
		group: Group::from_gid(Gid::from_raw(st.gid()))
			.ok()
			.flatten()
			.map(|group| group.name),
	}
}

fn round3(value: f64) -> f64 {
	(value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ratio_rounds_to_three_decimals() {
		assert_eq!(round3(0.123456), 0.123);
		assert_eq!(round3(2.7855), 2.786);
	}

	#[test]
	fn entry_meta_reflects_the_filesystem() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"x").unwrap();
		let st = std::fs::metadata(&path).unwrap();

		let meta = entry_meta(&st, "f".into());
		assert_eq!(meta.path, "f");
		assert_eq!(meta.st_uid, st.uid());
		assert_eq!(meta.st_mode, st.mode());
		assert!(meta.st_mtime_ns >= st.mtime() * 1_000_000_000);
	}
}
