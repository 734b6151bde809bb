const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const GIT_SHA: Option<&str> = option_env!("MODELDOCK_GIT_SHA");
const GIT_DIRTY: Option<&str> = option_env!("MODELDOCK_GIT_DIRTY");
const GIT_DATE: Option<&str> = option_env!("MODELDOCK_GIT_DATE");
const BUILD_TIMESTAMP: Option<&str> = option_env!("MODELDOCK_BUILD_TIMESTAMP");
const BUILD_PROFILE: Option<&str> = option_env!("MODELDOCK_BUILD_PROFILE");

/// Build metadata embedded by `build.rs`.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub git_dirty: &'static str,
    pub built_at: &'static str,
    pub profile: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        name: PKG_NAME,
        version: PKG_VERSION,
        git_sha: GIT_SHA.unwrap_or("unknown"),
        git_dirty: GIT_DIRTY.unwrap_or("unknown"),
        built_at: BUILD_TIMESTAMP.unwrap_or("unknown time"),
        profile: BUILD_PROFILE.unwrap_or("unknown profile"),
    }
}

/// Multi-line text for `modeldock version`.
pub fn describe() -> String {
    let info = build_info();
    [
        format!("{} {}", info.name, info.version),
        PKG_DESCRIPTION.to_string(),
        format!(
            "commit: {} ({}, {})",
            info.git_sha,
            GIT_DATE.unwrap_or("unknown date"),
            info.git_dirty
        ),
        format!("built: {} [{}]", info.built_at, info.profile),
    ]
    .join("\n")
}
