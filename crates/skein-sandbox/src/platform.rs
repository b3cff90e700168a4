//! Platform detection and isolation availability checking.

use std::fmt;
use std::process::Command;

/// Supported isolation platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// macOS using sandbox-exec (Seatbelt).
    MacOS,
    /// Linux using bubblewrap.
    Linux,
    /// Unsupported platform.
    Unsupported,
}

impl Platform {
    /// Detect the current platform.
    pub fn detect() -> Self {
        #[cfg(target_os = "macos")]
        {
            Platform::MacOS
        }

        #[cfg(target_os = "linux")]
        {
            Platform::Linux
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Platform::Unsupported
        }
    }

    /// Get the display name for this platform.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::MacOS => "macOS",
            Platform::Linux => "Linux",
            Platform::Unsupported => "Unsupported",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether OS-level isolation is available on this host.
#[derive(Debug, Clone)]
pub enum SandboxSupport {
    /// Isolation is available and ready to use.
    Available { platform: Platform },

    /// Isolation dependencies are missing.
    MissingDependency {
        platform: Platform,
        missing: Vec<String>,
        install_hint: String,
    },

    /// Platform is not supported.
    Unsupported { platform_name: String },
}

impl SandboxSupport {
    /// Check if isolation is available.
    pub fn is_available(&self) -> bool {
        matches!(self, SandboxSupport::Available { .. })
    }

    /// Get the install hint if dependencies are missing.
    pub fn install_hint(&self) -> Option<&str> {
        match self {
            SandboxSupport::MissingDependency { install_hint, .. } => Some(install_hint),
            _ => None,
        }
    }

    /// Detect isolation availability for the current platform.
    pub fn detect() -> Self {
        let platform = Platform::detect();

        match platform {
            Platform::MacOS => Self::check_macos(),
            Platform::Linux => Self::check_linux(),
            Platform::Unsupported => SandboxSupport::Unsupported {
                platform_name: std::env::consts::OS.to_string(),
            },
        }
    }

    fn check_macos() -> Self {
        // sandbox-exec ships with macOS; verify it is on PATH
        let sandbox_exec_exists = Command::new("which")
            .arg("sandbox-exec")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if sandbox_exec_exists {
            SandboxSupport::Available {
                platform: Platform::MacOS,
            }
        } else {
            SandboxSupport::MissingDependency {
                platform: Platform::MacOS,
                missing: vec!["sandbox-exec".to_string()],
                install_hint: "sandbox-exec should be built into macOS. Please ensure you're running a supported macOS version.".to_string(),
            }
        }
    }

    fn check_linux() -> Self {
        let bwrap_exists = Command::new("which")
            .arg("bwrap")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if bwrap_exists {
            SandboxSupport::Available {
                platform: Platform::Linux,
            }
        } else {
            let install_hint = "Step execution requires sandboxing for isolation.\n\
                 Install bubblewrap:\n\
                 \n\
                   Ubuntu/Debian: sudo apt-get install bubblewrap\n\
                   Fedora:        sudo dnf install bubblewrap\n\
                   Arch:          sudo pacman -S bubblewrap\n\
                   Alpine:        sudo apk add bubblewrap"
                .to_string();

            SandboxSupport::MissingDependency {
                platform: Platform::Linux,
                missing: vec!["bubblewrap".to_string()],
                install_hint,
            }
        }
    }
}

impl fmt::Display for SandboxSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxSupport::Available { platform } => {
                write!(f, "Sandbox available ({platform})")
            }
            SandboxSupport::MissingDependency {
                platform,
                missing,
                install_hint,
            } => {
                write!(
                    f,
                    "Sandbox unavailable on {platform}: missing {}\n\n{install_hint}",
                    missing.join(", ")
                )
            }
            SandboxSupport::Unsupported { platform_name } => {
                write!(f, "Sandbox not supported on {platform_name}")
            }
        }
    }
}
