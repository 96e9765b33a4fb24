//! Backup manifest: a gzip'd stream of line-delimited JSON records.
//!
//! Each line is a JSON object with exactly one key naming the record kind,
//! so the stream reads back as a sequence of tagged [`Record`]s. The first
//! record is always the [`Header`]; every `file` record is followed by its
//! `file_data` records (in ascending file offset) and closed by a
//! `file_summary`. Unknown record kinds are a hard parse error.

use std::{
	collections::{BTreeMap, HashMap},
	fs::File,
	io::{BufRead as _, BufReader, BufWriter, Write as _},
	path::Path,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use miette::{bail, IntoDiagnostic as _, Result, WrapErr as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::BlockId;

/// Manifest format version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// One line of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
	#[serde(rename = "baq_backup")]
	Header(Header),
	#[serde(rename = "directory")]
	Directory(EntryMeta),
	#[serde(rename = "file")]
	File(EntryMeta),
	#[serde(rename = "file_data")]
	FileData(FileData),
	#[serde(rename = "file_summary")]
	FileSummary(FileSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
	pub format_version: u32,
	pub backup_id: String,
	pub block_size: u64,
	pub single_file: bool,
}

/// Filesystem metadata shared by `directory` and `file` records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
	pub path: String,
	#[serde(with = "stringed")]
	pub st_mtime_ns: i64,
	#[serde(with = "stringed")]
	pub st_atime_ns: i64,
	#[serde(with = "stringed")]
	pub st_ctime_ns: i64,
	pub st_uid: u32,
	pub st_gid: u32,
	#[serde(with = "octal")]
	pub st_mode: u32,
	#[serde(default)]
	pub owner: Option<String>,
	#[serde(default)]
	pub group: Option<String>,
}

/// Where one block of a file lives: `size` bytes at `offset` of the source
/// file, stored as `store_size` bytes at `store_offset` of the `store_file`
/// object, encrypted under `aes_key`. Doubles as the dedup index value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
	pub offset: u64,
	pub size: u64,
	#[serde(with = "hex::serde")]
	pub sha3: BlockId,
	#[serde(with = "hex::serde")]
	pub aes_key: [u8; 32],
	pub store_file: String,
	pub store_offset: u64,
	pub store_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
	pub size: u64,
	pub compressed_size: u64,
	pub compression_ratio: f64,
	#[serde(with = "hex::serde")]
	pub sha1: [u8; 20],
}

/// `st_*_ns` values are decimal strings so readers in any language keep
/// full nanosecond precision.
mod stringed {
	use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(value)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
		String::deserialize(deserializer)?
			.parse()
			.map_err(D::Error::custom)
	}
}

/// `st_mode` is an `0o`-prefixed octal string.
mod octal {
	use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(&format_args!("0o{value:o}"))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
		let raw = String::deserialize(deserializer)?;
		let digits = raw.strip_prefix("0o").unwrap_or(&raw);
		u32::from_str_radix(digits, 8).map_err(D::Error::custom)
	}
}

/// Streaming manifest writer.
pub struct MetaWriter {
	out: GzEncoder<BufWriter<File>>,
}

impl MetaWriter {
	pub fn create(path: &Path) -> Result<Self> {
		let file = File::create(path)
			.into_diagnostic()
			.wrap_err_with(|| format!("creating manifest file {}", path.display()))?;
		Ok(Self {
			out: GzEncoder::new(BufWriter::new(file), Compression::default()),
		})
	}

	pub fn write(&mut self, record: &Record) -> Result<()> {
		let line = serde_json::to_string(record).into_diagnostic()?;
		if !matches!(record, Record::FileData(_)) {
			// file_data lines carry key material, keep them out of logs
			debug!("write_meta: {line}");
		}
		self.out.write_all(line.as_bytes()).into_diagnostic()?;
		self.out.write_all(b"\n").into_diagnostic()?;
		Ok(())
	}

	pub fn finish(self) -> Result<()> {
		self.out
			.finish()
			.into_diagnostic()
			.wrap_err("closing manifest stream")?
			.flush()
			.into_diagnostic()?;
		Ok(())
	}
}

/// One file's slice of the manifest.
#[derive(Debug, Clone)]
pub struct FileMeta {
	pub entry: EntryMeta,
	pub blocks: Vec<FileData>,
	pub original_size: u64,
	pub original_sha1: [u8; 20],
}

/// A fully parsed manifest, with a content-address index over every block.
#[derive(Debug, Clone)]
pub struct BackupMeta {
	pub backup_id: String,
	pub block_size: u64,
	pub single_file: bool,
	pub directories: BTreeMap<String, EntryMeta>,
	pub files: BTreeMap<String, FileMeta>,
	blocks: HashMap<BlockId, FileData>,
}

impl BackupMeta {
	pub fn read(path: &Path) -> Result<Self> {
		info!("Reading backup metadata from {}", path.display());
		let file = File::open(path)
			.into_diagnostic()
			.wrap_err_with(|| format!("opening manifest {}", path.display()))?;
		let mut lines = BufReader::new(GzDecoder::new(file)).lines();

		let mut next_record = move || -> Result<Option<Record>> {
			let Some(line) = lines.next() else {
				return Ok(None);
			};
			let line = line.into_diagnostic().wrap_err("reading manifest line")?;
			serde_json::from_str(&line)
				.into_diagnostic()
				.wrap_err_with(|| format!("parsing manifest record {line:?}"))
				.map(Some)
		};

		let header = match next_record()? {
			Some(Record::Header(header)) => header,
			other => bail!("manifest does not start with a header: {other:?}"),
		};
		if header.format_version != FORMAT_VERSION {
			bail!("unsupported manifest format version {}", header.format_version);
		}

		let mut meta = Self {
			backup_id: header.backup_id,
			block_size: header.block_size,
			single_file: header.single_file,
			directories: BTreeMap::new(),
			files: BTreeMap::new(),
			blocks: HashMap::new(),
		};

		while let Some(record) = next_record()? {
			match record {
				Record::Directory(dir) => {
					meta.directories.insert(dir.path.clone(), dir);
				}
				Record::File(entry) => {
					let mut blocks = Vec::new();
					let summary = loop {
						match next_record()? {
							Some(Record::FileData(block)) => {
								meta.blocks.insert(block.sha3, block.clone());
								blocks.push(block);
							}
							Some(Record::FileSummary(summary)) => break summary,
							other => bail!("unexpected record inside file {}: {other:?}", entry.path),
						}
					};
					meta.files.insert(
						entry.path.clone(),
						FileMeta {
							entry,
							blocks,
							original_size: summary.size,
							original_sha1: summary.sha1,
						},
					);
				}
				other => bail!("unexpected record: {other:?}"),
			}
		}

		debug!(
			files = meta.files.len(),
			blocks = meta.blocks.len(),
			"loaded backup metadata"
		);
		Ok(meta)
	}

	/// Look up a block by content address.
	pub fn get_block(&self, id: &BlockId) -> Option<&FileData> {
		self.blocks.get(id)
	}

	pub fn block_count(&self) -> usize {
		self.blocks.len()
	}
}

/// Format a backup id for `Utc::now()`-style timestamps.
pub fn backup_id_now() -> String {
	chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Object name for a backup's manifest.
pub fn meta_object_name(backup_id: &str) -> String {
	format!("baq.{backup_id}.meta")
}

/// Object name for the `number`th data file of a backup.
pub fn data_object_name(backup_id: &str, number: u64) -> String {
	format!("baq.{backup_id}.data-{number:06}")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_entry(path: &str) -> EntryMeta {
		EntryMeta {
			path: path.into(),
			st_mtime_ns: 1_700_000_000_123_456_789,
			st_atime_ns: 1_700_000_000_000_000_000,
			st_ctime_ns: 1_700_000_001_000_000_000,
			st_uid: 1000,
			st_gid: 1000,
			st_mode: 0o100644,
			owner: Some("user".into()),
			group: None,
		}
	}

	#[test]
	fn records_serialize_as_single_key_lines() {
		let line = serde_json::to_string(&Record::Header(Header {
			format_version: 1,
			backup_id: "20240101T000000Z".into(),
			block_size: 131072,
			single_file: false,
		}))
		.unwrap();
		assert!(line.starts_with(r#"{"baq_backup":{"#), "line: {line}");

		let line = serde_json::to_string(&Record::File(sample_entry("a/b.txt"))).unwrap();
		assert!(line.contains(r#""st_mode":"0o100644""#), "line: {line}");
		assert!(
			line.contains(r#""st_mtime_ns":"1700000000123456789""#),
			"line: {line}"
		);
	}

	#[test]
	fn unknown_record_is_an_error() {
		assert!(serde_json::from_str::<Record>(r#"{"whatever":{}}"#).is_err());
	}

	#[test]
	fn round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta");

		let block = FileData {
			offset: 0,
			size: 14,
			sha3: crate::crypto::block_id(b"Hello, world!\n"),
			aes_key: [7; 32],
			store_file: "baq.20240101T000000Z.data-000000".into(),
			store_offset: 0,
			store_size: 39,
		};

		let mut writer = MetaWriter::create(&path).unwrap();
		writer
			.write(&Record::Header(Header {
				format_version: 1,
				backup_id: "20240101T000000Z".into(),
				block_size: 131072,
				single_file: false,
			}))
			.unwrap();
		writer
			.write(&Record::Directory(sample_entry("sub")))
			.unwrap();
		writer
			.write(&Record::File(sample_entry("sub/hello.txt")))
			.unwrap();
		writer.write(&Record::FileData(block.clone())).unwrap();
		writer
			.write(&Record::FileSummary(FileSummary {
				size: 14,
				compressed_size: 39,
				compression_ratio: 2.786,
				sha1: crate::crypto::sha1(b"Hello, world!\n"),
			}))
			.unwrap();
		writer.finish().unwrap();

		let meta = BackupMeta::read(&path).unwrap();
		assert_eq!(meta.backup_id, "20240101T000000Z");
		assert_eq!(meta.block_size, 131072);
		assert!(!meta.single_file);
		assert_eq!(meta.directories.len(), 1);
		let file = &meta.files["sub/hello.txt"];
		assert_eq!(file.original_size, 14);
		assert_eq!(file.blocks, vec![block.clone()]);
		assert_eq!(meta.get_block(&block.sha3), Some(&block));
	}

	#[test]
	fn truncated_file_stream_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta");

		let mut writer = MetaWriter::create(&path).unwrap();
		writer
			.write(&Record::Header(Header {
				format_version: 1,
				backup_id: "20240101T000000Z".into(),
				block_size: 131072,
				single_file: false,
			}))
			.unwrap();
		writer
			.write(&Record::File(sample_entry("dangling.txt")))
			.unwrap();
		writer.finish().unwrap();

		assert!(BackupMeta::read(&path).is_err());
	}

	#[test]
	fn object_names() {
		assert_eq!(
			meta_object_name("20240101T000000Z"),
			"baq.20240101T000000Z.meta"
		);
		assert_eq!(
			data_object_name("20240101T000000Z", 3),
			"baq.20240101T000000Z.data-000003"
		);
	}
}
