use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Milliseconds since the Unix epoch, UTC
pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stable identifier for this device, used as the calibration key.
///
/// `RELOC_DEVICE_ID` wins over the machine id.
pub fn device_unique_id() -> String {
    if let Ok(id) = std::env::var("RELOC_DEVICE_ID") {
        if !id.trim().is_empty() {
            return id.trim().to_owned();
        }
    }

    match std::fs::read_to_string(MACHINE_ID_PATH) {
        Ok(id) if !id.trim().is_empty() => id.trim().to_owned(),
        _ => {
            debug!("No machine id at {}, using placeholder", MACHINE_ID_PATH);
            "unknown-device".to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_timestamp_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_device_id_not_empty() {
        assert!(!device_unique_id().is_empty());
    }
}
