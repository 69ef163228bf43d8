//! Platforms the installer knows how to target.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::Result;

/// A closed set of platform identifiers; each contributes kernel arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Platform {
    Metal,
    Aws,
    Gcp,
    Azure,
    Nocloud,
}

impl Platform {
    pub(crate) const ALL: &[Self] = &[
        Self::Metal,
        Self::Aws,
        Self::Gcp,
        Self::Azure,
        Self::Nocloud,
    ];

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Metal => "metal",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Nocloud => "nocloud",
        }
    }

    /// Kernel arguments required to boot on this platform.
    pub(crate) fn kernel_args(&self, arch: &str) -> &'static [&'static str] {
        match (self, arch) {
            (Self::Metal, "amd64") => &["console=ttyS0"],
            (Self::Metal, _) => &[],
            (Self::Aws, _) => &["console=tty1", "console=ttyS0", "net.ifnames=0"],
            (Self::Gcp, _) => &["console=ttyS0", "net.ifnames=0"],
            (Self::Azure, _) => &[
                "console=ttyS0,115200n8",
                "earlyprintk=ttyS0,115200",
                "rootdelay=300",
            ],
            (Self::Nocloud, _) => &["console=tty1", "console=ttyS0"],
        }
    }
}

/// The architecture of the running machine, in installer asset naming.
pub(crate) fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        o => o,
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown platform: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        for p in Platform::ALL {
            assert_eq!(p.name().parse::<Platform>().unwrap(), *p);
        }
        assert!("openstackish".parse::<Platform>().is_err());
    }

    #[test]
    fn test_kernel_args() {
        assert_eq!(Platform::Metal.kernel_args("amd64"), ["console=ttyS0"]);
        assert!(Platform::Metal.kernel_args("arm64").is_empty());
        assert!(Platform::Aws.kernel_args("arm64").contains(&"net.ifnames=0"));
    }

    #[test]
    fn test_host_arch() {
        let arch = host_arch();
        assert!(!arch.is_empty());
        assert_ne!(arch, "x86_64");
        assert_ne!(arch, "aarch64");
    }
}
