//! Reference protocol engines.
//!
//! Each engine produces and consumes one wire message per call and owns the
//! cryptographic state of a single handshake. The session manager sequences
//! the calls; the engines know nothing about exchanges, timers or the key
//! table. Authentication inputs (passwords, certificates, token keys, key
//! export authorization) come from delegate traits supplied by the embedder.

pub mod cert;
pub mod key_export;
pub mod password;
pub mod token;

/// Highest configuration bit set in both `allowed` and `supported`.
pub(crate) fn preferred_config(allowed: u8, supported: u8) -> Option<u8> {
    let common = allowed & supported;
    if common == 0 {
        return None;
    }
    Some(1 << (7 - common.leading_zeros()))
}

/// True if `config` is a single bit contained in `mask`.
pub(crate) fn config_allowed(config: u8, mask: u8) -> bool {
    config.count_ones() == 1 && mask & config != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_is_highest_common_bit() {
        assert_eq!(preferred_config(0x03, 0x03), Some(0x02));
        assert_eq!(preferred_config(0x01, 0x03), Some(0x01));
        assert_eq!(preferred_config(0x04, 0x03), None);
    }

    #[test]
    fn multi_bit_config_never_allowed() {
        assert!(config_allowed(0x02, 0x03));
        assert!(!config_allowed(0x03, 0x03));
        assert!(!config_allowed(0x00, 0xFF));
    }
}
