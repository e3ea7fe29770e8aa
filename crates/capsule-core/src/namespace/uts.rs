//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname and domain name.

use nix::errno::Errno;

/// Longest hostname the kernel accepts.
pub const HOSTNAME_MAX: usize = 64;

/// Sets the hostname inside the UTS namespace.
///
/// # Errors
///
/// Returns the errno if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<(), Errno> {
    nix::unistd::sethostname(hostname)?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}

/// Returns `true` if `name` is a valid RFC 1123 hostname.
#[must_use]
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= HOSTNAME_MAX
        && name.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_validation() {
        assert!(is_valid_hostname("box"));
        assert!(is_valid_hostname("node-1.cluster"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-lead"));
        assert!(!is_valid_hostname("under_score"));
        assert!(!is_valid_hostname(&"a".repeat(65)));
    }
}
