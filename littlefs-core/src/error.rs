use core::fmt;

/// Unified error type for littlefs-core.
///
/// Every variant maps onto the negative errno-style code the on-disk
/// tooling expects, see [`LfsError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfsError {
    /// Error during device operation
    Io,
    /// Corrupted metadata or a failed read-back validation
    Corrupt,
    /// No directory entry
    NoEnt,
    /// Entry already exists
    Exist,
    /// Entry is not a directory
    NotDir,
    /// Entry is a directory
    IsDir,
    /// Directory is not empty
    NotEmpty,
    /// Bad file handle or access mode
    BadF,
    /// File too large
    FBig,
    /// Invalid parameter or unsupported on-disk version
    Inval,
    /// No space left on device
    NoSpc,
    /// No more memory available
    NoMem,
    /// No attribute of that type
    NoAttr,
    /// File name too long
    NameTooLong,
}

impl LfsError {
    /// Negative error code as stored in C-style return values.
    pub const fn code(self) -> i32 {
        match self {
            LfsError::Io => -5,
            LfsError::Corrupt => -84,
            LfsError::NoEnt => -2,
            LfsError::Exist => -17,
            LfsError::NotDir => -20,
            LfsError::IsDir => -21,
            LfsError::NotEmpty => -39,
            LfsError::BadF => -9,
            LfsError::FBig => -27,
            LfsError::Inval => -22,
            LfsError::NoSpc => -28,
            LfsError::NoMem => -12,
            LfsError::NoAttr => -61,
            LfsError::NameTooLong => -36,
        }
    }

    /// Inverse of [`LfsError::code`].
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -5 => LfsError::Io,
            -84 => LfsError::Corrupt,
            -2 => LfsError::NoEnt,
            -17 => LfsError::Exist,
            -20 => LfsError::NotDir,
            -21 => LfsError::IsDir,
            -39 => LfsError::NotEmpty,
            -9 => LfsError::BadF,
            -27 => LfsError::FBig,
            -22 => LfsError::Inval,
            -28 => LfsError::NoSpc,
            -12 => LfsError::NoMem,
            -61 => LfsError::NoAttr,
            -36 => LfsError::NameTooLong,
            _ => return None,
        })
    }
}

impl fmt::Display for LfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LfsError::Io => "device I/O error",
            LfsError::Corrupt => "corrupted metadata",
            LfsError::NoEnt => "no such entry",
            LfsError::Exist => "entry exists",
            LfsError::NotDir => "not a directory",
            LfsError::IsDir => "is a directory",
            LfsError::NotEmpty => "directory not empty",
            LfsError::BadF => "bad file handle",
            LfsError::FBig => "file too large",
            LfsError::Inval => "invalid parameter",
            LfsError::NoSpc => "no space left",
            LfsError::NoMem => "out of memory",
            LfsError::NoAttr => "no such attribute",
            LfsError::NameTooLong => "name too long",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}

/// Convenience Result type alias.
pub type Result<T> = ::core::result::Result<T, LfsError>;

#[cfg(test)]
mod tests {
    use super::LfsError;

    #[test]
    fn test_codes_round_trip_through_from_code() {
        for err in [
            LfsError::Io,
            LfsError::Corrupt,
            LfsError::NoEnt,
            LfsError::NameTooLong,
            LfsError::NoAttr,
        ] {
            assert_eq!(LfsError::from_code(err.code()), Some(err));
        }
        assert_eq!(LfsError::from_code(0), None);
    }

    #[test]
    fn test_display_includes_code() {
        let text = alloc::format!("{}", LfsError::NoSpc);
        assert!(text.contains("-28"));
    }
}
