use crate::constants::FIELD_SEPARATOR;
use crate::error::ProtocolError;

/// Longest filename accepted, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// Validates a filename announced on the wire.
///
/// The name must be a single path component, since receivers join it
/// onto their download directory. Rejects:
/// - Empty names, `.` and `..`
/// - Path separators (`/`, `\`)
/// - The field separator `:` (also blocks Windows drive prefixes)
/// - NUL and other control characters
/// - Names longer than [`MAX_FILENAME_LEN`] bytes
pub fn validate_filename(name: &str) -> Result<(), ProtocolError> {
    let reject = |reason| {
        Err(ProtocolError::InvalidFilename {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return Err(ProtocolError::EmptyFilename);
    }
    if name == "." || name == ".." {
        return reject("relative directory reference");
    }
    if name.len() > MAX_FILENAME_LEN {
        return reject("name too long");
    }
    if name.contains(['/', '\\']) {
        return reject("path separator not allowed");
    }
    if name.contains(FIELD_SEPARATOR) {
        return reject("':' not allowed");
    }
    if name.chars().any(char::is_control) {
        return reject("control character not allowed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert_eq!(validate_filename(""), Err(ProtocolError::EmptyFilename));
    }

    #[test]
    fn rejects_dot_entries() {
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("..").is_err());
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(validate_filename("../../etc/passwd").is_err());
        assert!(validate_filename("..\\secret").is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(validate_filename("/etc/passwd").is_err());
        assert!(validate_filename("C:\\Windows").is_err());
        assert!(validate_filename("\\\\server\\share").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_filename("a\0b").is_err());
        assert!(validate_filename("line\nbreak").is_err());
    }

    #[test]
    fn rejects_overlong_names() {
        assert!(validate_filename(&"a".repeat(MAX_FILENAME_LEN)).is_ok());
        assert!(validate_filename(&"a".repeat(MAX_FILENAME_LEN + 1)).is_err());
    }

    #[test]
    fn accepts_normal_names() {
        assert!(validate_filename("a.txt").is_ok());
        assert!(validate_filename(".hidden").is_ok());
        assert!(validate_filename("report v2 (final).pdf").is_ok());
        assert!(validate_filename("naïve.txt").is_ok());
    }
}
