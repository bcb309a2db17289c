//! Build stamps logged by the `overlay-commit` startup banner

use std::env;
use std::process::Command;

fn stamp(key: &str, value: &str) {
    println!("cargo:rustc-env={}={}", key, value);
}

fn short_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn main() {
    stamp(
        "OVERLAY_BUILD_DATE",
        &chrono::Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
    );
    stamp(
        "OVERLAY_BUILD_TARGET",
        &env::var("TARGET").unwrap_or_else(|_| "unknown".into()),
    );
    stamp(
        "OVERLAY_BUILD_PROFILE",
        &env::var("PROFILE").unwrap_or_else(|_| "unknown".into()),
    );
    if let Some(commit) = short_commit() {
        stamp("OVERLAY_GIT_COMMIT", &commit);
    }

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
