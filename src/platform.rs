/// Runtime OS-family detection.
///
/// The family is detected once at startup and drives every OS-specific choice
/// (tree-kill strategy, CPU-time probe, log line ending) so the rest of the
/// crate never branches on the OS itself.
use std::fmt;

/// Operating-system families with distinct process-management behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Linux,
    Darwin,
}

impl OsFamily {
    /// Detect the family of the running OS.
    pub fn detect() -> Result<Self, PlatformError> {
        Self::from_os_name(std::env::consts::OS)
    }

    /// Map a `std::env::consts::OS` value to a family.
    pub fn from_os_name(name: &str) -> Result<Self, PlatformError> {
        match name {
            "windows" => Ok(OsFamily::Windows),
            "linux" => Ok(OsFamily::Linux),
            "macos" => Ok(OsFamily::Darwin),
            other => Err(PlatformError::Unsupported {
                os: other.to_string(),
            }),
        }
    }

    /// Line terminator used for the run log.
    pub fn line_ending(self) -> &'static str {
        match self {
            OsFamily::Windows => "\r\n",
            OsFamily::Linux | OsFamily::Darwin => "\n",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsFamily::Windows => "windows",
            OsFamily::Linux => "linux",
            OsFamily::Darwin => "darwin",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum PlatformError {
    Unsupported { os: String },
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Unsupported { os } => {
                write!(f, "unsupported operating system '{os}'")
            }
        }
    }
}

impl std::error::Error for PlatformError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_os_name() {
        assert_eq!(OsFamily::from_os_name("windows").unwrap(), OsFamily::Windows);
        assert_eq!(OsFamily::from_os_name("linux").unwrap(), OsFamily::Linux);
        assert_eq!(OsFamily::from_os_name("macos").unwrap(), OsFamily::Darwin);
    }

    #[test]
    fn test_unsupported_os() {
        let err = OsFamily::from_os_name("haiku").unwrap_err();
        assert!(err.to_string().contains("haiku"));
    }

    #[test]
    fn test_line_endings() {
        assert_eq!(OsFamily::Windows.line_ending(), "\r\n");
        assert_eq!(OsFamily::Linux.line_ending(), "\n");
        assert_eq!(OsFamily::Darwin.line_ending(), "\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_detect_on_linux() {
        assert_eq!(OsFamily::detect().unwrap(), OsFamily::Linux);
    }
}
