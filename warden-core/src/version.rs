use std::fmt::{Display, Formatter};
use std::{env, fmt};

const BUILD_VERSION: &str = env!("WARDEN_BUILD_VERSION");
const BUILD_GIT_SHA: &str = env!("WARDEN_BUILD_GIT_SHA");
const BUILD_RUST_VERSION: &str = env!("WARDEN_BUILD_RUSTC_VERSION");
const BUILD_RUST_PROFILE: &str = env!("WARDEN_BUILD_PROFILE_NAME");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub git_revision: String,
	pub rust_version: String,
	pub build_profile: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION.to_string(),
			git_revision: BUILD_GIT_SHA.to_string(),
			rust_version: BUILD_RUST_VERSION.to_string(),
			build_profile: BUILD_RUST_PROFILE.to_string(),
		}
	}

	/// The first 24 bits of the build's git SHA, published as the `server.version` stat.
	/// Fails hard (per spec) if the SHA is not a parseable hex string - an un-fingerprinted
	/// build should not silently report a bogus version.
	pub fn version_stat(&self) -> anyhow::Result<u32> {
		sha_prefix_as_u32(&self.git_revision)
	}
}

fn sha_prefix_as_u32(sha: &str) -> anyhow::Result<u32> {
	let prefix = sha
		.get(..6)
		.ok_or_else(|| anyhow::anyhow!("build SHA '{sha}' is too short to fingerprint"))?;
	u32::from_str_radix(prefix, 16)
		.map_err(|e| anyhow::anyhow!("build SHA '{sha}' is not valid hex: {e}"))
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{RustVersion:\"{}\", BuildProfile:\"{}\", Version:\"{}\", GitRevision:\"{}\"}}",
			self.rust_version, self.build_profile, self.version, self.git_revision
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_valid_sha_prefix() {
		assert_eq!(sha_prefix_as_u32("abcdef0123456789").unwrap(), 0x00abcdef);
	}

	#[test]
	fn rejects_non_hex_sha() {
		assert!(sha_prefix_as_u32("zzzzzz").is_err());
	}

	#[test]
	fn rejects_short_sha() {
		assert!(sha_prefix_as_u32("abc").is_err());
	}
}
