
use std::process::Command;

// Exports build metadata as AUTHN_SIM_BUILD_* environment variables for src/version.rs.
fn main() -> Result<(), anyhow::Error> {
    let rustc = rustc_version::version()?;
    let revision = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let status = match git(&["status", "--porcelain"]) {
        Some(s) if s.is_empty() => "Clean",
        Some(_) => "Modified",
        None => "unknown",
    };
    let tag = git(&["describe", "--tags", "--always"]).unwrap_or_else(|| "unknown".to_string());
    let version = std::env::var("BUILD_VERSION")
        .or_else(|_| std::env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=AUTHN_SIM_BUILD_buildVersion={version}");
    println!("cargo:rustc-env=AUTHN_SIM_BUILD_buildGitRevision={revision}");
    println!("cargo:rustc-env=AUTHN_SIM_BUILD_buildStatus={status}");
    println!("cargo:rustc-env=AUTHN_SIM_BUILD_buildTag={tag}");
    println!("cargo:rustc-env=AUTHN_SIM_BUILD_RUSTC_VERSION={rustc}");
    println!("cargo:rerun-if-env-changed=BUILD_VERSION");
    Ok(())
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
