//! Injects `RELAY_VERSION` and `RELAY_GIT_SHA` for `/status` and the startup log.
//!
//! Each value comes from the environment when set (release pipelines), then
//! from Cargo or git, then "unknown".

use std::env;
use std::process::Command;

const TRACKED_ENV: &[&str] = &["RELAY_VERSION", "RELAY_GIT_SHA", "GITHUB_SHA"];

fn main() {
    let version = env::var("RELAY_VERSION")
        .or_else(|_| env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "unknown".to_string());

    let git_sha = env::var("RELAY_GIT_SHA")
        .ok()
        .or_else(|| env::var("GITHUB_SHA").ok().map(|sha| short_sha(&sha)))
        .or_else(git_head)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=RELAY_VERSION={}", version);
    println!("cargo:rustc-env=RELAY_GIT_SHA={}", git_sha);
    for key in TRACKED_ENV {
        println!("cargo:rerun-if-env-changed={}", key);
    }
}

fn short_sha(sha: &str) -> String {
    sha.chars().take(7).collect()
}

fn git_head() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8(output.stdout).ok()?;
    let sha = sha.trim();
    (!sha.is_empty()).then(|| sha.to_string())
}
