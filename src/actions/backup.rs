use std::path::PathBuf;

use clap::{Parser, ValueHint};
use miette::{bail, IntoDiagnostic as _, Result};
use tracing::instrument;

use crate::{
	actions::Context,
	backend,
	backup::{default_cache_dir, do_backup, BackupConfig, DEFAULT_BLOCK_SIZE},
	envelope,
};

/// Back up a directory tree, a single file, or a block device.
///
/// Files are split into fixed-size blocks, compressed, encrypted, and packed
/// into large data objects at the destination. Blocks already uploaded by a
/// previous backup to the same destination are referenced instead of being
/// uploaded again, so repeat backups only pay for what changed.
///
/// The backup manifest is encrypted to the given age recipients; restoring
/// requires a matching identity. Keep at least one identity somewhere safe,
/// without it a backup is unreadable.
#[derive(Debug, Clone, Parser)]
pub struct BackupArgs {
	/// What to back up.
	///
	/// A directory is backed up recursively, with symlinks dereferenced. A
	/// regular file or a block device is backed up as a single file, which
	/// can later be restored to an arbitrary path.
	#[arg(value_hint = ValueHint::AnyPath, value_name = "PATH")]
	pub local_path: PathBuf,

	/// Where to back up to.
	///
	/// Either s3://bucket/prefix or file:///some/directory. Repeat backups
	/// to the same URL share block storage via the local dedup cache.
	#[arg(value_name = "URL")]
	pub backup_url: String,

	/// Encrypt the backup manifest to this age recipient.
	///
	/// Takes a public key (age1…), a secret key (the public half is
	/// derived), or a path to an identity file. May be given multiple times;
	/// any one matching identity can restore.
	#[arg(long, short = 'r', value_name = "KEY")]
	pub recipient: Vec<String>,

	/// S3 storage class for uploaded objects.
	#[arg(long, value_name = "CLASS", default_value = "STANDARD_IA")]
	pub s3_storage_class: String,

	/// Block size in bytes for a first backup to a destination.
	///
	/// Later backups inherit the block size of the previous backup, so that
	/// unchanged data keeps deduplicating whatever this is set to.
	#[arg(long, env = "BAQ_BLOCK_SIZE", value_name = "BYTES", default_value_t = DEFAULT_BLOCK_SIZE)]
	pub block_size: u64,

	/// Where the previous backup's manifest is cached for dedup.
	#[arg(long, env = "BAQ_CACHE_DIR", value_name = "PATH", default_value_os_t = default_cache_dir())]
	pub cache_dir: PathBuf,
}

#[instrument(skip(ctx))]
pub async fn run(ctx: Context<BackupArgs>) -> Result<()> {
	let (args, ctx) = ctx.take_top();

	if args.recipient.is_empty() {
		bail!("No encryption recipients were specified");
	}
	let recipients = args
		.recipient
		.iter()
		.map(|arg| envelope::parse_recipient(arg))
		.collect::<Result<Vec<_>>>()?;

	let local_path = if args.local_path.exists() {
		args.local_path.canonicalize().into_diagnostic()?
	} else {
		args.local_path.clone()
	};

	let backend = backend::from_url(&args.backup_url, Some(args.s3_storage_class.clone())).await?;
	let config = BackupConfig {
		block_size: args.block_size,
		cache_dir: args.cache_dir.clone(),
		..BackupConfig::default()
	};

	do_backup(ctx, &local_path, backend, &recipients, config).await
}
