//! Restore planner and executor.
//!
//! Blocks are grouped by the data file they live in, sorted by their stored
//! offset, and fetched in range-coalesced batches. Before fetching, each
//! destination range is scanned: a block whose bytes already hash to the
//! right content address is left alone, which makes restore idempotent and
//! resumable. Writers decrypt, decompress, re-verify and seat each block at
//! its file offset; a final pass recreates empty entries and applies
//! ownership, permissions and timestamps.

use std::{
	collections::{BTreeMap, VecDeque},
	fs::{OpenOptions, Permissions},
	io::{ErrorKind, Read, Seek as _, SeekFrom, Write as _},
	os::unix::fs::{FileTypeExt as _, PermissionsExt as _},
	path::{Path, PathBuf},
	sync::{Arc, Mutex as StdMutex},
};

use age::Identity;
use filetime::FileTime;
use miette::{bail, miette, IntoDiagnostic as _, Result, WrapErr as _};
use sha1::{Digest as _, Sha1};
use tokio::{sync::Semaphore, task};
use tracing::{debug, info, instrument, warn};

use crate::{
	actions::Context,
	backend::ObjectStore,
	crypto, envelope,
	manifest::{BackupMeta, FileData},
};

const RESTORE_POOL: usize = 24;
const SCAN_CONCURRENCY: usize = 8;
const FETCH_CONCURRENCY: usize = 16;
const WRITE_POOL: usize = 8;

/// Largest number of blocks one restore task handles.
const TASK_BLOCKS: usize = 1000;

/// Outstanding writes per task before the fetcher waits for them.
const PENDING_WRITES: usize = 100;

/// Where restored entries land.
enum RestoreTarget {
	/// Relative manifest paths are joined under this directory.
	Into(PathBuf),
	/// Everything goes to exactly this path (single-file restores).
	Exact(PathBuf),
}

impl RestoreTarget {
	fn resolve(&self, relative: &str) -> PathBuf {
		match self {
			Self::Into(dir) => dir.join(relative),
			Self::Exact(path) => path.clone(),
		}
	}
}

#[derive(Clone)]
struct Pools {
	pool: Arc<Semaphore>,
	scan: Arc<Semaphore>,
	fetch: Arc<Semaphore>,
	write: Arc<Semaphore>,
	dir_mutex: Arc<StdMutex<()>>,
}

/// Restore the backup described by `meta_name` on `backend` into
/// `local_path`, unwrapping the manifest with `identities`.
#[instrument(skip_all, fields(meta = %meta_name, path = %local_path.display()))]
pub async fn do_restore(
	ctx: Context,
	backend: Arc<dyn ObjectStore>,
	meta_name: &str,
	local_path: &Path,
	identities: &[Box<dyn Identity>],
) -> Result<()> {
	let temp_dir = tempfile::Builder::new()
		.prefix("baq.")
		.tempdir()
		.into_diagnostic()
		.wrap_err("creating temporary directory")?;
	info!("Restoring {meta_name} to {}", local_path.display());

	let sealed_path = temp_dir.path().join("meta.age");
	let meta_path = temp_dir.path().join("meta");
	backend.get_object(meta_name, &sealed_path).await?;
	envelope::decrypt_file(&sealed_path, &meta_path, identities).await?;

	let meta = Arc::new(
		task::spawn_blocking(move || BackupMeta::read(&meta_path))
			.await
			.into_diagnostic()?
			.wrap_err("parsing backup metadata")?,
	);

	let target = Arc::new(resolve_target(&meta, local_path)?);

	// group the needed blocks by the data file they live in
	let mut data_file_map: BTreeMap<String, Vec<(String, FileData)>> = BTreeMap::new();
	for (file_path, file_meta) in &meta.files {
		for block in &file_meta.blocks {
			data_file_map
				.entry(block.store_file.clone())
				.or_default()
				.push((file_path.clone(), block.clone()));
		}
	}
	debug!(
		"Will be restoring from files:{}",
		data_file_map
			.iter()
			.map(|(name, blocks)| format!("\n  - {name} ({} blocks)", blocks.len()))
			.collect::<String>()
	);

	let mut tasks = Vec::new();
	let mut total_stored_bytes = 0u64;
	for (name, mut blocks) in data_file_map {
		blocks.sort_by_key(|(_, block)| block.store_offset);
		total_stored_bytes += blocks.iter().map(|(_, b)| b.store_size).sum::<u64>();
		let mut blocks = VecDeque::from(blocks);
		while !blocks.is_empty() {
			let chunk: Vec<_> = blocks.drain(..blocks.len().min(TASK_BLOCKS)).collect();
			tasks.push((name.clone(), chunk));
		}
	}
	// reading each data file roughly front to back keeps the object store
	// happy on sequential media
	tasks.sort_by_key(|(_, chunk)| chunk[0].1.store_offset);

	let pools = Pools {
		pool: Arc::new(Semaphore::new(RESTORE_POOL)),
		scan: Arc::new(Semaphore::new(SCAN_CONCURRENCY)),
		fetch: Arc::new(Semaphore::new(FETCH_CONCURRENCY)),
		write: Arc::new(Semaphore::new(WRITE_POOL)),
		dir_mutex: Arc::new(StdMutex::new(())),
	};
	let progress = ctx.data_bar(total_stored_bytes);
	progress.set_message(local_path.display().to_string());

	let mut handles = Vec::with_capacity(tasks.len());
	for (store_file_name, chunk) in tasks {
		handles.push(tokio::spawn(restore_from_data_file(
			Arc::clone(&backend),
			store_file_name,
			chunk,
			Arc::clone(&target),
			pools.clone(),
			progress.clone(),
		)));
	}

	let mut result = Ok(());
	for handle in handles {
		match handle.await.into_diagnostic() {
			Ok(Ok(())) => {}
			Ok(Err(err)) | Err(err) => {
				if result.is_ok() {
					result = Err(err);
				}
			}
		}
	}
	progress.finish_and_clear();
	ctx.progress.remove(&progress);
	result?;

	// all data is on disk; recreate what had no data and apply metadata
	let meta = Arc::clone(&meta);
	let target = Arc::clone(&target);
	task::spawn_blocking(move || apply_metadata(&meta, &target))
		.await
		.into_diagnostic()??;

	info!("Restore finished");
	Ok(())
}

fn resolve_target(meta: &BackupMeta, local_path: &Path) -> Result<RestoreTarget> {
	let is_block_device = std::fs::metadata(local_path)
		.map(|st| st.file_type().is_block_device())
		.unwrap_or(false);

	if meta.single_file {
		if local_path.is_dir() {
			let (file_path, _) = meta
				.files
				.iter()
				.next()
				.ok_or_else(|| miette!("single-file backup contains no file"))?;
			let file_name = Path::new(file_path)
				.file_name()
				.ok_or_else(|| miette!("backed-up file has no usable name: {file_path:?}"))?;
			Ok(RestoreTarget::Exact(local_path.join(file_name)))
		} else if local_path.is_file() || is_block_device || !local_path.exists() {
			Ok(RestoreTarget::Exact(local_path.to_path_buf()))
		} else {
			bail!("Please provide a directory, file or a block device to restore single file");
		}
	} else if local_path.is_dir() {
		Ok(RestoreTarget::Into(local_path.to_path_buf()))
	} else if !local_path.exists() {
		info!("Creating restore directory {}", local_path.display());
		std::fs::create_dir(local_path)
			.into_diagnostic()
			.wrap_err("creating restore directory")?;
		Ok(RestoreTarget::Into(local_path.to_path_buf()))
	} else {
		bail!("Please provide a directory to restore into");
	}
}

/// Restore one batch of blocks that live in the same data file.
async fn restore_from_data_file(
	backend: Arc<dyn ObjectStore>,
	store_file_name: String,
	blocks: Vec<(String, FileData)>,
	target: Arc<RestoreTarget>,
	pools: Pools,
	progress: indicatif::ProgressBar,
) -> Result<()> {
	let _pool = Arc::clone(&pools.pool)
		.acquire_owned()
		.await
		.into_diagnostic()?;

	let needed = {
		let _scan = pools.scan.acquire().await.into_diagnostic()?;
		let target = Arc::clone(&target);
		let progress = progress.clone();
		task::spawn_blocking(move || scan_blocks(&target, blocks, &progress))
			.await
			.into_diagnostic()??
	};

	if needed.is_empty() {
		debug!("Nothing to restore from {store_file_name}");
		return Ok(());
	}

	let ranges: Vec<(u64, u64)> = needed
		.iter()
		.map(|(_, block)| (block.store_offset, block.store_size))
		.collect();

	// held until every range is consumed, so at most this many tasks have a
	// body stream open
	let _fetch = pools.fetch.acquire().await.into_diagnostic()?;
	let mut fetched = backend.get_ranges(&store_file_name, ranges).await?;

	let mut writes: VecDeque<task::JoinHandle<Result<()>>> = VecDeque::new();
	for (original_path, block) in needed {
		let encrypted = fetched
			.recv()
			.await
			.ok_or_else(|| miette!("range stream for {store_file_name} ended early"))??;

		let restore_path = target.resolve(&original_path);
		let write_slots = Arc::clone(&pools.write);
		let dir_mutex = Arc::clone(&pools.dir_mutex);
		let progress = progress.clone();
		writes.push_back(tokio::spawn(async move {
			let _slot = write_slots.acquire_owned().await.into_diagnostic()?;
			let store_size = block.store_size;
			task::spawn_blocking(move || {
				write_restore_block(&block, &encrypted, &restore_path, &dir_mutex)
			})
			.await
			.into_diagnostic()??;
			progress.inc(store_size);
			Ok(())
		}));

		while writes.len() > PENDING_WRITES {
			// UNWRAP: len > 0
			writes.pop_front().unwrap().await.into_diagnostic()??;
		}
	}

	while let Some(handle) = writes.pop_front() {
		handle.await.into_diagnostic()??;
	}

	debug!("Restored {store_file_name} batch");
	Ok(())
}

enum BlockState {
	AlreadyRestored,
	Missing,
	Changed,
}

/// Drop blocks whose destination bytes already match their content address.
///
/// An earlier interrupted restore leaves correct blocks behind; those are
/// kept in place. Destination data that is present but different is
/// restored over, with a note when it was not just zeros.
fn scan_blocks(
	target: &RestoreTarget,
	blocks: Vec<(String, FileData)>,
	progress: &indicatif::ProgressBar,
) -> Result<Vec<(String, FileData)>> {
	let mut needed = Vec::new();
	for (original_path, block) in blocks {
		let restore_path = target.resolve(&original_path);
		match check_block(&restore_path, &block)? {
			BlockState::AlreadyRestored => {
				debug!(
					"File {original_path} offset {} length {} is already restored",
					block.offset, block.size
				);
				progress.inc(block.store_size);
			}
			state => {
				debug!(
					"File {original_path} offset {} length {} needs to be restored{}",
					block.offset,
					block.size,
					if matches!(state, BlockState::Changed) {
						" (data changed)"
					} else {
						""
					}
				);
				needed.push((original_path, block));
			}
		}
	}
	Ok(needed)
}

fn check_block(path: &Path, block: &FileData) -> Result<BlockState> {
	let mut file = match std::fs::File::open(path) {
		Ok(file) => file,
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BlockState::Missing),
		Err(err) => {
			return Err(err)
				.into_diagnostic()
				.wrap_err_with(|| format!("scanning {}", path.display()))
		}
	};

	file.seek(SeekFrom::Start(block.offset)).into_diagnostic()?;
	let mut data = Vec::with_capacity(block.size as usize);
	Read::by_ref(&mut file)
		.take(block.size)
		.read_to_end(&mut data)
		.into_diagnostic()?;

	if data.is_empty() {
		return Ok(BlockState::Missing);
	}
	if crypto::block_id(&data) == block.sha3 {
		return Ok(BlockState::AlreadyRestored);
	}
	if data.iter().all(|byte| *byte == 0) {
		Ok(BlockState::Missing)
	} else {
		Ok(BlockState::Changed)
	}
}

fn write_restore_block(
	block: &FileData,
	encrypted: &[u8],
	restore_path: &Path,
	dir_mutex: &StdMutex<()>,
) -> Result<()> {
	debug!(
		"Restoring {} offset {} length {} from {} (offset {} length {})",
		restore_path.display(),
		block.offset,
		block.size,
		block.store_file,
		block.store_offset,
		block.store_size
	);

	let compressed = crypto::decrypt_aes(encrypted, &block.aes_key)?;
	let data = zstd::stream::decode_all(&compressed[..])
		.into_diagnostic()
		.wrap_err("decompressing block")?;
	if crypto::block_id(&data) != block.sha3 {
		bail!(
			"block at {} offset {} failed checksum verification",
			restore_path.display(),
			block.offset
		);
	}

	{
		let _guard = dir_mutex.lock().expect("BUG: directory mutex poisoned");
		// UNWRAP: restore paths always have a parent
		let parent = restore_path.parent().unwrap();
		if !parent.exists() {
			debug!("Creating directory {}", parent.display());
			std::fs::create_dir_all(parent).into_diagnostic()?;
		}
	}

	// open for update; fall back to exclusive-create then update so that
	// two writers racing on a fresh file cannot clobber each other
	let mut file = match OpenOptions::new().read(true).write(true).open(restore_path) {
		Ok(file) => file,
		Err(err) if err.kind() == ErrorKind::NotFound => {
			match OpenOptions::new()
				.write(true)
				.create_new(true)
				.open(restore_path)
			{
				Ok(file) => file,
				Err(err) if err.kind() == ErrorKind::AlreadyExists => OpenOptions::new()
					.read(true)
					.write(true)
					.open(restore_path)
					.into_diagnostic()?,
				Err(err) => {
					return Err(err)
						.into_diagnostic()
						.wrap_err_with(|| format!("creating {}", restore_path.display()))
				}
			}
		}
		Err(err) => {
			return Err(err)
				.into_diagnostic()
				.wrap_err_with(|| format!("opening {}", restore_path.display()))
		}
	};

	file.seek(SeekFrom::Start(block.offset)).into_diagnostic()?;
	file.write_all(&data).into_diagnostic()?;
	file.flush().into_diagnostic()?;
	Ok(())
}

/// Recreate empty entries, verify whole-file checksums, and apply
/// ownership, permissions and timestamps recorded in the manifest.
fn apply_metadata(meta: &BackupMeta, target: &RestoreTarget) -> Result<()> {
	for dir_path in meta.directories.keys() {
		let full = target.resolve(dir_path);
		match std::fs::create_dir(&full) {
			Ok(()) => {}
			Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
			Err(err) => {
				return Err(err)
					.into_diagnostic()
					.wrap_err_with(|| format!("creating directory {}", full.display()))
			}
		}
	}

	for (file_path, file_meta) in &meta.files {
		let full = target.resolve(file_path);

		if file_meta.original_size == 0 && !full.exists() {
			std::fs::File::create(&full)
				.into_diagnostic()
				.wrap_err_with(|| format!("creating empty file {}", full.display()))?;
		}

		let file_type = std::fs::metadata(&full)
			.into_diagnostic()
			.wrap_err_with(|| format!("examining restored {}", full.display()))?
			.file_type();

		if file_type.is_block_device() {
			// device targets only get their content verified
			if sha1_file(&full, Some(file_meta.original_size))? == file_meta.original_sha1 {
				info!("Checksum {file_path} OK");
			} else {
				bail!("Checksum failed for {file_path}");
			}
			continue;
		}

		if !file_type.is_file() {
			bail!("restored path {} is not a regular file", full.display());
		}

		let on_disk = std::fs::metadata(&full).into_diagnostic()?.len();
		if on_disk > file_meta.original_size {
			// blocks kept from an earlier restore may extend past the
			// original length
			let file = OpenOptions::new()
				.write(true)
				.open(&full)
				.into_diagnostic()?;
			file.set_len(file_meta.original_size).into_diagnostic()?;
		} else if on_disk < file_meta.original_size {
			bail!(
				"restored file {} is short: {on_disk} of {} bytes",
				full.display(),
				file_meta.original_size
			);
		}

		if sha1_file(&full, None)? == file_meta.original_sha1 {
			info!("Checksum {file_path} OK");
		} else {
			bail!("Checksum failed for {file_path}");
		}

		apply_entry_metadata(
			&full,
			file_meta.entry.st_uid,
			file_meta.entry.st_gid,
			file_meta.entry.st_mode,
			file_meta.entry.st_atime_ns,
			file_meta.entry.st_mtime_ns,
		)?;
	}

	// children first, so directory mtimes survive their contents being
	// touched
	for (dir_path, dir_meta) in meta.directories.iter().rev() {
		let full = target.resolve(dir_path);
		apply_entry_metadata(
			&full,
			dir_meta.st_uid,
			dir_meta.st_gid,
			dir_meta.st_mode,
			dir_meta.st_atime_ns,
			dir_meta.st_mtime_ns,
		)?;
	}

	Ok(())
}

fn apply_entry_metadata(
	path: &Path,
	uid: u32,
	gid: u32,
	mode: u32,
	atime_ns: i64,
	mtime_ns: i64,
) -> Result<()> {
	if let Err(err) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
		// expected when not running as root
		warn!(
			"Failed to chown {} to uid {uid} gid {gid}: {err}",
			path.display()
		);
	}

	std::fs::set_permissions(path, Permissions::from_mode(mode & 0o777))
		.into_diagnostic()
		.wrap_err_with(|| format!("setting permissions on {}", path.display()))?;

	filetime::set_file_times(path, filetime_from_ns(atime_ns), filetime_from_ns(mtime_ns))
		.into_diagnostic()
		.wrap_err_with(|| format!("setting times on {}", path.display()))?;

	Ok(())
}

fn filetime_from_ns(ns: i64) -> FileTime {
	FileTime::from_unix_time(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32)
}

fn sha1_file(path: &Path, limit: Option<u64>) -> Result<[u8; 20]> {
	let file = std::fs::File::open(path)
		.into_diagnostic()
		.wrap_err_with(|| format!("opening {} for checksum", path.display()))?;
	let mut hasher = Sha1::new();
	let mut reader: Box<dyn Read> = match limit {
		Some(limit) => Box::new(file.take(limit)),
		None => Box::new(file),
	};
	std::io::copy(&mut reader, &mut hasher).into_diagnostic()?;
	Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scan_detects_restored_missing_and_changed() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		let mut content = b"hello world, here is a block".to_vec();
		std::fs::write(&path, &content).unwrap();

		let block = FileData {
			offset: 0,
			size: content.len() as u64,
			sha3: crypto::block_id(&content),
			aes_key: [0; 32],
			store_file: "x".into(),
			store_offset: 0,
			store_size: 0,
		};

		assert!(matches!(
			check_block(&path, &block).unwrap(),
			BlockState::AlreadyRestored
		));

		content[0] ^= 0xff;
		std::fs::write(&path, &content).unwrap();
		assert!(matches!(
			check_block(&path, &block).unwrap(),
			BlockState::Changed
		));

		std::fs::write(&path, vec![0u8; content.len()]).unwrap();
		assert!(matches!(
			check_block(&path, &block).unwrap(),
			BlockState::Missing
		));

		assert!(matches!(
			check_block(&dir.path().join("absent"), &block).unwrap(),
			BlockState::Missing
		));
	}

	#[test]
	fn write_block_verifies_content_address() {
		let dir = tempfile::tempdir().unwrap();
		let mutex = StdMutex::new(());

		let data = b"block contents".to_vec();
		let key = crypto::generate_key();
		let compressed = zstd::stream::encode_all(&data[..], 9).unwrap();
		let encrypted = crypto::encrypt_aes(&compressed, &key);

		let good = FileData {
			offset: 0,
			size: data.len() as u64,
			sha3: crypto::block_id(&data),
			aes_key: key,
			store_file: "x".into(),
			store_offset: 0,
			store_size: encrypted.len() as u64,
		};
		let path = dir.path().join("sub/out");
		write_restore_block(&good, &encrypted, &path, &mutex).unwrap();
		assert_eq!(std::fs::read(&path).unwrap(), data);

		let bad = FileData {
			sha3: crypto::block_id(b"something else"),
			..good
		};
		assert!(write_restore_block(&bad, &encrypted, &path, &mutex).is_err());
	}

	#[test]
	fn sha1_file_respects_limit() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"0123456789").unwrap();

		assert_eq!(
			sha1_file(&path, None).unwrap(),
			crypto::sha1(b"0123456789")
		);
		assert_eq!(sha1_file(&path, Some(4)).unwrap(), crypto::sha1(b"0123"));
	}
}
