//! End-to-end backup and restore scenarios over the file backend.

use std::{
	os::unix::fs::{MetadataExt as _, PermissionsExt as _},
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use age::{secrecy::ExposeSecret as _, x25519};
use baq::{
	backend::{FileBackend, ObjectStore},
	backup::{do_backup, BackupConfig},
	crypto,
	manifest::BackupMeta,
	restore::do_restore,
	Context,
};
use rand::RngCore as _;

/// Block size used throughout; small enough that a few KiB of data spans
/// many blocks.
const BLOCK_SIZE: u64 = 1024;

struct TestEnv {
	root: tempfile::TempDir,
	secret_key: String,
}

impl TestEnv {
	fn new() -> Self {
		Self {
			root: tempfile::tempdir().unwrap(),
			secret_key: x25519::Identity::generate()
				.to_string()
				.expose_secret()
				.to_string(),
		}
	}

	fn store_dir(&self) -> PathBuf {
		self.root.path().join("store")
	}

	fn backend(&self) -> Arc<dyn ObjectStore> {
		Arc::new(FileBackend::new(&format!("file://{}", self.store_dir().display())).unwrap())
	}

	fn config(&self) -> BackupConfig {
		BackupConfig {
			block_size: BLOCK_SIZE,
			cache_dir: self.root.path().join("cache"),
			workers: 2,
			..BackupConfig::default()
		}
	}

	fn recipients(&self) -> Vec<Box<dyn age::Recipient + Send>> {
		let identity: x25519::Identity = self.secret_key.parse().unwrap();
		vec![Box::new(identity.to_public())]
	}

	fn identities(&self) -> Vec<Box<dyn age::Identity>> {
		let identity: x25519::Identity = self.secret_key.parse().unwrap();
		vec![Box::new(identity)]
	}

	async fn backup(&self, src: &Path) {
		do_backup(
			Context::new(),
			src,
			self.backend(),
			&self.recipients(),
			self.config(),
		)
		.await
		.unwrap();
	}

	async fn restore(&self, meta_name: &str, dst: &Path) {
		do_restore(
			Context::new(),
			self.backend(),
			meta_name,
			dst,
			&self.identities(),
		)
		.await
		.unwrap();
	}

	async fn objects(&self) -> Vec<String> {
		self.backend().list("baq.").await.unwrap()
	}

	async fn latest_meta(&self) -> String {
		self.objects()
			.await
			.into_iter()
			.filter(|name| name.ends_with(".meta"))
			.next_back()
			.expect("no meta object at destination")
	}

	fn object_size(&self, name: &str) -> u64 {
		std::fs::metadata(self.store_dir().join(name)).unwrap().len()
	}

	/// The plaintext manifest of the latest backup, from the dedup cache.
	fn cached_meta(&self) -> BackupMeta {
		let cache_name = self.backend().cache_name();
		BackupMeta::read(
			&self
				.root
				.path()
				.join("cache")
				.join(cache_name)
				.join("last-meta"),
		)
		.unwrap()
	}
}

fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
	for (path, content) in files {
		let full = root.join(path);
		std::fs::create_dir_all(full.parent().unwrap()).unwrap();
		std::fs::write(full, content).unwrap();
	}
}

fn random_bytes(len: usize) -> Vec<u8> {
	let mut data = vec![0u8; len];
	rand::thread_rng().fill_bytes(&mut data);
	data
}

/// Backup ids have second resolution; two backups in one test need distinct
/// ids to not collide on object names.
async fn next_backup_id() {
	tokio::time::sleep(Duration::from_millis(1100)).await;
}

#[tokio::test]
async fn tree_round_trips_byte_exact() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	write_tree(
		&src,
		&[
			("hello.txt", b"Hello, World!\n"),
			("dir1/sample.txt", b"This is dir1/sample.txt\n"),
		],
	);
	std::fs::set_permissions(
		src.join("hello.txt"),
		std::fs::Permissions::from_mode(0o600),
	)
	.unwrap();

	env.backup(&src).await;

	let objects = env.objects().await;
	assert_eq!(objects.len(), 2, "objects: {objects:?}");
	assert!(objects[0].ends_with(".data-000000"), "objects: {objects:?}");
	assert!(objects[1].ends_with(".meta"), "objects: {objects:?}");

	let dst = env.root.path().join("restore");
	env.restore(&objects[1], &dst).await;

	assert_eq!(
		std::fs::read(dst.join("hello.txt")).unwrap(),
		b"Hello, World!\n"
	);
	assert_eq!(
		std::fs::read(dst.join("dir1/sample.txt")).unwrap(),
		b"This is dir1/sample.txt\n"
	);

	// permissions and timestamps come back too
	let restored = std::fs::metadata(dst.join("hello.txt")).unwrap();
	assert_eq!(restored.permissions().mode() & 0o777, 0o600);
	let source = std::fs::metadata(src.join("hello.txt")).unwrap();
	assert_eq!(
		restored.mtime() * 1_000_000_000 + restored.mtime_nsec(),
		source.mtime() * 1_000_000_000 + source.mtime_nsec()
	);
}

#[tokio::test]
async fn single_file_snapshot_survives_source_overwrite() {
	let env = TestEnv::new();
	let src = env.root.path().join("file1.txt");
	std::fs::write(&src, b"Hello, world!\n").unwrap();

	env.backup(&src).await;
	let meta = env.latest_meta().await;

	// trash the source; the snapshot must not care
	std::fs::write(&src, random_bytes(1000)).unwrap();

	let dst = env.root.path().join("out/restored.txt");
	env.restore(&meta, &dst).await;
	assert_eq!(std::fs::read(&dst).unwrap(), b"Hello, world!\n");

	// restoring into a directory drops the file inside it, under its
	// original name
	let dir_dst = env.root.path().join("outdir");
	std::fs::create_dir(&dir_dst).unwrap();
	env.restore(&meta, &dir_dst).await;
	assert_eq!(
		std::fs::read(dir_dst.join("file1.txt")).unwrap(),
		b"Hello, world!\n"
	);
}

#[tokio::test]
async fn second_backup_only_stores_changed_blocks() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	std::fs::create_dir(&src).unwrap();

	let mut content = random_bytes(3_000_000);
	std::fs::write(src.join("big.bin"), &content).unwrap();

	env.backup(&src).await;
	let first_data = env.objects().await[0].clone();
	assert!(
		env.object_size(&first_data) > 3_000_000,
		"random data should not compress below its size"
	);

	next_backup_id().await;

	// flip 100 bytes in the middle
	for byte in &mut content[1_500_000..1_500_100] {
		*byte ^= 0xff;
	}
	std::fs::write(src.join("big.bin"), &content).unwrap();

	env.backup(&src).await;
	let objects = env.objects().await;
	assert_eq!(objects.len(), 4, "objects: {objects:?}");
	let second_data = objects
		.iter()
		.filter(|name| name.ends_with(".data-000000"))
		.next_back()
		.unwrap();
	assert_ne!(second_data, &first_data);
	assert!(
		env.object_size(second_data) < 1_500_000,
		"second backup stored {} bytes",
		env.object_size(second_data)
	);

	// the block size is inherited from the first backup
	assert_eq!(env.cached_meta().block_size, BLOCK_SIZE);

	let dst = env.root.path().join("restore");
	env.restore(&env.latest_meta().await, &dst).await;
	assert_eq!(std::fs::read(dst.join("big.bin")).unwrap(), content);
}

#[tokio::test]
async fn empty_file_round_trips() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	write_tree(&src, &[("empty.txt", b"")]);

	env.backup(&src).await;

	let meta = env.cached_meta();
	let file = &meta.files["empty.txt"];
	assert_eq!(file.original_size, 0);
	assert!(file.blocks.is_empty());

	let dst = env.root.path().join("restore");
	env.restore(&env.latest_meta().await, &dst).await;
	assert_eq!(std::fs::read(dst.join("empty.txt")).unwrap(), b"");
}

#[tokio::test]
async fn block_sized_file_is_exactly_one_block() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	std::fs::create_dir(&src).unwrap();
	std::fs::write(src.join("one.bin"), random_bytes(BLOCK_SIZE as usize)).unwrap();

	env.backup(&src).await;

	let meta = env.cached_meta();
	let blocks = &meta.files["one.bin"].blocks;
	assert_eq!(blocks.len(), 1);
	assert_eq!(blocks[0].offset, 0);
	assert_eq!(blocks[0].size, BLOCK_SIZE);
}

#[tokio::test]
async fn identical_files_share_their_blocks() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	std::fs::create_dir(&src).unwrap();

	let content = random_bytes(100 * 1024);
	std::fs::write(src.join("a.bin"), &content).unwrap();
	std::fs::write(src.join("b.bin"), &content).unwrap();

	env.backup(&src).await;

	let meta = env.cached_meta();
	assert_eq!(meta.files["a.bin"].blocks, meta.files["b.bin"].blocks);
	assert_eq!(meta.block_count(), 100 * 1024 / BLOCK_SIZE as usize);

	let dst = env.root.path().join("restore");
	env.restore(&env.latest_meta().await, &dst).await;
	assert_eq!(std::fs::read(dst.join("a.bin")).unwrap(), content);
	assert_eq!(std::fs::read(dst.join("b.bin")).unwrap(), content);
}

#[tokio::test]
async fn every_manifest_block_is_fetchable_and_contiguous() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	write_tree(
		&src,
		&[
			("small.txt", b"tiny"),
			("exact.bin", &[7u8; 2048]),
			("odd.bin", &random_bytes(2500)),
		],
	);

	env.backup(&src).await;

	let backend = env.backend();
	let meta = env.cached_meta();
	for (path, file) in &meta.files {
		// blocks partition [0, original_size) in order
		let mut expected_offset = 0;
		for block in &file.blocks {
			assert_eq!(block.offset, expected_offset, "in {path}");
			expected_offset += block.size;

			// and each one is independently addressable in the store
			let stored = backend
				.get_range(&block.store_file, block.store_offset, block.store_size)
				.await
				.unwrap();
			let compressed = crypto::decrypt_aes(&stored, &block.aes_key).unwrap();
			let raw = zstd::stream::decode_all(&compressed[..]).unwrap();
			assert_eq!(raw.len() as u64, block.size, "in {path}");
			assert_eq!(crypto::block_id(&raw), block.sha3, "in {path}");
		}
		assert_eq!(expected_offset, file.original_size, "in {path}");
	}
}

#[tokio::test]
async fn restore_is_idempotent_and_resumable() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	write_tree(
		&src,
		&[
			("keep.bin", &random_bytes(10 * 1024)),
			("deep/nested/file.bin", &random_bytes(3 * 1024)),
		],
	);

	env.backup(&src).await;
	let meta = env.latest_meta().await;
	let dst = env.root.path().join("restore");

	env.restore(&meta, &dst).await;
	let first = std::fs::read(dst.join("keep.bin")).unwrap();

	// an interrupted or repeated restore settles to the same bytes
	env.restore(&meta, &dst).await;
	assert_eq!(std::fs::read(dst.join("keep.bin")).unwrap(), first);

	// damage part of a restored file; a re-run repairs it
	let damaged = dst.join("keep.bin");
	let mut bytes = std::fs::read(&damaged).unwrap();
	for byte in &mut bytes[2048..4096] {
		*byte = 0xaa;
	}
	bytes.truncate(8 * 1024);
	std::fs::write(&damaged, &bytes).unwrap();

	env.restore(&meta, &dst).await;
	assert_eq!(std::fs::read(&damaged).unwrap(), first);
}

#[tokio::test]
async fn manifest_object_is_opaque_without_identity() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	write_tree(&src, &[("secret.txt", b"the manifest itself is sealed")]);

	env.backup(&src).await;
	let meta_name = env.latest_meta().await;

	// the stored manifest is not readable as a plain manifest stream
	let sealed = env.root.path().join("sealed.meta");
	env.backend()
		.get_object(&meta_name, &sealed)
		.await
		.unwrap();
	assert!(BackupMeta::read(&sealed).is_err());
}

#[tokio::test]
async fn multipart_rollover_still_round_trips() {
	let env = TestEnv::new();
	let src = env.root.path().join("src");
	let content = random_bytes(64 * 1024);
	write_tree(&src, &[("spread.bin", &content)]);

	// tiny caps: many parts per data file, several data files per backup
	let config = BackupConfig {
		data_file_size: 16 * 1024,
		part_size: 4 * 1024,
		..env.config()
	};
	do_backup(
		Context::new(),
		&src,
		env.backend(),
		&env.recipients(),
		config,
	)
	.await
	.unwrap();

	let objects = env.objects().await;
	let data_files: Vec<_> = objects
		.iter()
		.filter(|name| name.contains(".data-"))
		.collect();
	assert!(data_files.len() > 1, "objects: {objects:?}");

	let dst = env.root.path().join("restore");
	env.restore(&env.latest_meta().await, &dst).await;
	assert_eq!(std::fs::read(dst.join("spread.bin")).unwrap(), content);
}
