use std::path::PathBuf;

use clap::{Parser, ValueHint};
use miette::Result;
use tracing::instrument;

use crate::{actions::Context, backend, envelope, restore::do_restore};

/// Restore a backup.
///
/// Downloads and decrypts the backup manifest, then fetches only the blocks
/// that are not already in place at the destination, so an interrupted
/// restore can simply be run again. Every block and every whole file is
/// checksum-verified.
#[derive(Debug, Clone, Parser)]
pub struct RestoreArgs {
	/// Full URL of the manifest object to restore from.
	///
	/// This must include the `baq.<backup-id>.meta` object name, e.g.
	/// s3://bucket/prefix/baq.20240101T000000Z.meta.
	#[arg(value_name = "URL")]
	pub backup_url: String,

	/// Where to restore to.
	///
	/// For a directory backup: an existing or to-be-created directory. For a
	/// single-file backup: a directory to place the file in, or the exact
	/// file, block device, or fresh path to write.
	#[arg(value_hint = ValueHint::AnyPath, value_name = "PATH")]
	pub local_path: PathBuf,

	/// age identity file used to decrypt the manifest.
	///
	/// May be given multiple times; identities are tried in order.
	#[arg(long, short = 'i', value_name = "PATH", required = true)]
	pub identity: Vec<PathBuf>,
}

#[instrument(skip(ctx))]
pub async fn run(ctx: Context<RestoreArgs>) -> Result<()> {
	let (args, ctx) = ctx.take_top();

	let (base_url, meta_name) = backend::split_meta_url(&args.backup_url)?;
	let identities = envelope::load_identities(&args.identity)?;
	let backend = backend::from_url(&base_url, None).await?;

	do_restore(ctx, backend, &meta_name, &args.local_path, &identities).await
}
