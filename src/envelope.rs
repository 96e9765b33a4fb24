//! Manifest envelope encryption.
//!
//! The manifest is a single opaque blob as far as the object store is
//! concerned: it is gzip'd by the manifest writer and then enveloped here
//! with [age](https://age-encryption.org) to one or more x25519 recipients.
//! Restore unwraps the envelope with identity files before parsing.

use std::{
	fmt::Debug,
	path::{Path, PathBuf},
};

use age::{x25519, Decryptor, Encryptor, Identity, IdentityFile, Recipient};
use miette::{bail, miette, Context as _, IntoDiagnostic as _, Result};
use tokio::{fs::File, io::AsyncWriteExt as _};
use tokio_util::compat::{
	FuturesAsyncReadCompatExt as _, FuturesAsyncWriteCompatExt as _, TokioAsyncReadCompatExt as _,
	TokioAsyncWriteCompatExt as _,
};
use tracing::{instrument, trace};

/// Parse a `--recipient` argument into an age recipient.
///
/// Accepts a literal public key (`age1…`), a literal secret key
/// (`AGE-SECRET-KEY-…`, the public half is derived), or a path to a file
/// containing either form or an identity file.
pub fn parse_recipient(arg: &str) -> Result<Box<dyn Recipient + Send>> {
	if arg.starts_with("age1") {
		return arg
			.parse::<x25519::Recipient>()
			.map(|key| Box::new(key) as _)
			.map_err(|err| miette!("{err}").wrap_err("parsing public key"));
	}

	if arg.starts_with("AGE-SECRET-KEY") {
		return arg
			.parse::<x25519::Identity>()
			.map(|sec| Box::new(sec.to_public()) as _)
			.map_err(|err| miette!("{err}").wrap_err("parsing secret key"));
	}

	let path = Path::new(arg);
	if path.is_file() {
		let contents = std::fs::read_to_string(path)
			.into_diagnostic()
			.wrap_err_with(|| format!("reading recipient file {}", path.display()))?;
		return IdentityFile::from_buffer(contents.as_bytes())
			.into_diagnostic()
			.wrap_err("parsing recipient file")?
			.to_recipients()
			.into_diagnostic()
			.wrap_err("parsing recipients from identity")?
			.pop()
			.ok_or_else(|| miette!("no recipient found in {}", path.display()));
	}

	bail!("recipient {arg:?} is not an age key nor a file");
}

/// Load age identities from `--identity` files.
pub fn load_identities(paths: &[PathBuf]) -> Result<Vec<Box<dyn Identity>>> {
	let mut identities = Vec::with_capacity(paths.len());
	for path in paths {
		let contents = std::fs::read_to_string(path)
			.into_diagnostic()
			.wrap_err_with(|| format!("reading identity file {}", path.display()))?;
		identities.extend(
			IdentityFile::from_buffer(contents.as_bytes())
				.into_diagnostic()
				.wrap_err_with(|| format!("parsing identity file {}", path.display()))?
				.into_identities()
				.into_diagnostic()
				.wrap_err_with(|| format!("parsing keys from {}", path.display()))?,
		);
	}

	if identities.is_empty() {
		bail!("no identities found in the given files");
	}

	Ok(identities)
}

/// Envelope a file to the given recipients.
#[instrument(level = "debug", skip(recipients))]
pub async fn encrypt_file(
	input_path: impl AsRef<Path> + Debug,
	output_path: impl AsRef<Path> + Debug,
	recipients: &[Box<dyn Recipient + Send>],
) -> Result<u64> {
	let mut input = File::open(input_path)
		.await
		.into_diagnostic()
		.wrap_err("opening the plaintext")?;
	let output = File::create_new(output_path)
		.await
		.into_diagnostic()
		.wrap_err("opening the encrypted output")?;

	let mut encrypting_writer =
		Encryptor::with_recipients(recipients.iter().map(|key| &**key as &dyn Recipient))
			.into_diagnostic()
			.wrap_err("building the envelope")?
			.wrap_async_output(output.compat_write())
			.await
			.into_diagnostic()?
			.compat_write();

	let bytes = tokio::io::copy(&mut input, &mut encrypting_writer)
		.await
		.into_diagnostic()
		.wrap_err("encrypting data in stream")?;

	encrypting_writer
		.shutdown()
		.await
		.into_diagnostic()
		.wrap_err("closing the encrypted output")?;

	trace!(?bytes, "envelope written");
	Ok(bytes)
}

/// Unwrap an enveloped file with the given identities.
///
/// Errors if none of the identities match, or if the output is empty, which
/// is never the case for a well-formed manifest.
#[instrument(level = "debug", skip(identities))]
pub async fn decrypt_file(
	input_path: impl AsRef<Path> + Debug,
	output_path: impl AsRef<Path> + Debug,
	identities: &[Box<dyn Identity>],
) -> Result<u64> {
	let input = File::open(input_path)
		.await
		.into_diagnostic()
		.wrap_err("opening the input file")?;
	let mut output = File::create_new(output_path)
		.await
		.into_diagnostic()
		.wrap_err("opening the output file")?;

	let mut decrypting_reader = Decryptor::new_async(input.compat())
		.await
		.into_diagnostic()
		.wrap_err("reading the envelope")?
		.decrypt_async(identities.iter().map(|id| &**id as &dyn Identity))
		.into_diagnostic()
		.wrap_err("unwrapping the envelope")?
		.compat();

	let bytes = tokio::io::copy(&mut decrypting_reader, &mut output)
		.await
		.into_diagnostic()
		.wrap_err("decrypting data")?;

	output
		.shutdown()
		.await
		.into_diagnostic()
		.wrap_err("closing the output stream")?;

	if bytes == 0 {
		bail!("decryption produced empty output");
	}

	trace!(?bytes, "envelope unwrapped");
	Ok(bytes)
}

#[cfg(test)]
mod tests {
	use age::secrecy::ExposeSecret as _;

	use super::*;

	#[tokio::test]
	async fn envelope_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let plain = dir.path().join("plain");
		let sealed = dir.path().join("sealed");
		let opened = dir.path().join("opened");

		std::fs::write(&plain, b"line one\nline two\n").unwrap();

		let secret = x25519::Identity::generate();
		let recipients: Vec<Box<dyn Recipient + Send>> = vec![Box::new(secret.to_public())];

		encrypt_file(&plain, &sealed, &recipients).await.unwrap();
		assert!(std::fs::metadata(&sealed).unwrap().len() > 0);
		assert_ne!(std::fs::read(&sealed).unwrap(), b"line one\nline two\n");

		let identities: Vec<Box<dyn Identity>> = vec![Box::new(secret)];
		decrypt_file(&sealed, &opened, &identities).await.unwrap();
		assert_eq!(std::fs::read(&opened).unwrap(), b"line one\nline two\n");
	}

	#[tokio::test]
	async fn wrong_identity_fails() {
		let dir = tempfile::tempdir().unwrap();
		let plain = dir.path().join("plain");
		let sealed = dir.path().join("sealed");

		std::fs::write(&plain, b"contents").unwrap();

		let secret = x25519::Identity::generate();
		let recipients: Vec<Box<dyn Recipient + Send>> = vec![Box::new(secret.to_public())];
		encrypt_file(&plain, &sealed, &recipients).await.unwrap();

		let other: Vec<Box<dyn Identity>> = vec![Box::new(x25519::Identity::generate())];
		assert!(decrypt_file(&sealed, dir.path().join("nope"), &other)
			.await
			.is_err());
	}

	#[test]
	fn recipient_parsing() {
		let secret = x25519::Identity::generate();
		let public = secret.to_public().to_string();

		assert!(parse_recipient(&public).is_ok());
		assert!(parse_recipient("not a key at all").is_err());

		let dir = tempfile::tempdir().unwrap();
		let keyfile = dir.path().join("identity.txt");
		std::fs::write(
			&keyfile,
			format!(
				"# public key: {public}\n{}\n",
				secret.to_string().expose_secret()
			),
		)
		.unwrap();
		assert!(parse_recipient(keyfile.to_str().unwrap()).is_ok());
	}
}
