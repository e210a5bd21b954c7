//! Version and build information

use std::fmt;

/// Build information embedded at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short git commit hash
    pub git_hash: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    /// Target triple
    pub target: &'static str,
    /// debug / release
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("LLMESH_GIT_HASH"),
            git_dirty: env!("LLMESH_GIT_DIRTY"),
            build_timestamp: env!("LLMESH_BUILD_TIMESTAMP"),
            target: env!("LLMESH_TARGET"),
            profile: env!("LLMESH_PROFILE"),
            rustc_version: env!("LLMESH_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// e.g. "0.1.0-abc1234" or "0.1.0-abc1234-dirty"
    pub fn full_version(&self) -> String {
        let mut v = format!("{}-{}", self.version, self.git_hash);
        if self.git_dirty() {
            v.push_str("-dirty");
        }
        v
    }

    /// Version string announced to the relay
    pub fn node_version(&self) -> String {
        format!("{} ({})", self.version, self.git_hash)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "  Git Hash:  {}{}", self.git_hash, if self.git_dirty() { " (dirty)" } else { "" })?;
        writeln!(f, "  Built:     {}", self.build_timestamp)?;
        writeln!(f, "  Target:    {}", self.target)?;
        writeln!(f, "  Profile:   {}", self.profile)?;
        writeln!(f, "  Compiler:  {}", self.rustc_version)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

/// Print version information to stdout
pub fn print_version() {
    print!("{}", build_info());
}
