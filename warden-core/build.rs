use std::env;
use std::process::Command;

fn main() {
	let out_dir = env::var("OUT_DIR").unwrap();
	// Adopted from https://github.com/uutils/coreutils/blob/main/src/uu/stdbuf/build.rs
	let profile_name = out_dir
		.split(std::path::MAIN_SEPARATOR)
		.nth_back(3)
		.unwrap_or("unknown");

	let git_sha = Command::new("git")
		.args(["rev-parse", "HEAD"])
		.output()
		.ok()
		.filter(|o| o.status.success())
		.and_then(|o| String::from_utf8(o.stdout).ok())
		.map(|s| s.trim().to_string())
		.unwrap_or_else(|| "0".repeat(40));

	let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());

	println!("cargo:rustc-env=WARDEN_BUILD_GIT_SHA={git_sha}");
	println!("cargo:rustc-env=WARDEN_BUILD_VERSION={version}");
	println!("cargo:rustc-env=WARDEN_BUILD_PROFILE_NAME={profile_name}");
	println!(
		"cargo:rustc-env=WARDEN_BUILD_RUSTC_VERSION={}",
		rustc_version::version().unwrap()
	);
	println!("cargo:rerun-if-changed=../.git/HEAD");
}
