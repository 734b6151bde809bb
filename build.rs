use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=GIT_DIR");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");

    emit("MODELDOCK_GIT_SHA", git(&["rev-parse", "--short", "HEAD"]));
    emit("MODELDOCK_GIT_DATE", git(&["show", "-s", "--format=%cI", "HEAD"]));

    let dirty = match git(&["status", "--porcelain"]) {
        Ok(output) if output.trim().is_empty() => "clean",
        Ok(_) => "dirty",
        Err(_) => "unknown",
    };
    println!("cargo:rustc-env=MODELDOCK_GIT_DIRTY={dirty}");

    println!(
        "cargo:rustc-env=MODELDOCK_BUILD_TIMESTAMP={}",
        Utc::now().to_rfc3339()
    );
    println!(
        "cargo:rustc-env=MODELDOCK_BUILD_PROFILE={}",
        env::var("PROFILE").unwrap_or_else(|_| "unknown".into())
    );
}

fn git(args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .map_err(|err| err.to_string())?;
    if !output.status.success() {
        return Err(format!("git {:?} exited with {:?}", args, output.status.code()));
    }
    String::from_utf8(output.stdout)
        .map(|text| text.trim().to_string())
        .map_err(|err| err.to_string())
}

fn emit(key: &str, value: Result<String, String>) {
    match value {
        Ok(value) => println!("cargo:rustc-env={key}={value}"),
        Err(err) => println!("cargo:warning={key} unavailable: {err}"),
    }
}
