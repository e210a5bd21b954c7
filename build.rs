//! Build script for the LLMesh node
//!
//! Embeds git revision, build time, target and profile so `version`
//! and the startup log can report exactly what is running.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = git(&["rev-parse", "--short=8", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let git_dirty = match git(&["status", "--porcelain"]) {
        Some(out) if !out.is_empty() => "true",
        Some(_) => "false",
        None => "unknown",
    };
    let rustc = Command::new("rustc")
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let vars = [
        ("LLMESH_GIT_HASH", git_hash),
        ("LLMESH_GIT_DIRTY", git_dirty.to_string()),
        (
            "LLMESH_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("LLMESH_TARGET", env_or_unknown("TARGET")),
        ("LLMESH_PROFILE", env_or_unknown("PROFILE")),
        ("LLMESH_RUSTC_VERSION", rustc),
    ];
    for (key, value) in vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// Run git and return trimmed stdout on success
fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
}

fn env_or_unknown(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}
