use sha2::{Digest, Sha256};

use crate::models::FingerprintQuality;

/// Stable per-host identifier: SHA-256(machine-id + GPU serial), falling back to the
/// hostname (marked unknown-quality) when neither is available.
pub fn compute(machine_id: Option<&str>, gpu_serial: Option<&str>, hostname: &str) -> (String, FingerprintQuality) {
    match machine_id {
        Some(machine_id) => {
            let mut hasher = Sha256::new();
            hasher.update(machine_id.as_bytes());
            if let Some(serial) = gpu_serial {
                hasher.update(serial.as_bytes());
            }
            (hex::encode(hasher.finalize()), FingerprintQuality::MachineId)
        }
        None => {
            let mut hasher = Sha256::new();
            hasher.update(hostname.as_bytes());
            (hex::encode(hasher.finalize()), FingerprintQuality::HostnameFallback)
        }
    }
}

pub fn read_machine_id() -> Option<String> {
    std::fs::read_to_string("/etc/machine-id").ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_produce_same_fingerprint() {
        let (a, quality_a) = compute(Some("abc123"), Some("serial-1"), "host1");
        let (b, quality_b) = compute(Some("abc123"), Some("serial-1"), "host2");
        assert_eq!(a, b);
        assert_eq!(quality_a, FingerprintQuality::MachineId);
        assert_eq!(quality_b, FingerprintQuality::MachineId);
    }

    #[test]
    fn different_machine_ids_produce_different_fingerprints() {
        let (a, _) = compute(Some("abc123"), None, "host1");
        let (b, _) = compute(Some("xyz987"), None, "host1");
        assert_ne!(a, b);
    }

    #[test]
    fn falls_back_to_hostname_with_unknown_quality() {
        let (_, quality) = compute(None, None, "host1");
        assert_eq!(quality, FingerprintQuality::HostnameFallback);
    }
}
