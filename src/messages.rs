use serde_derive::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq)]
pub enum EngineCommand {
    Energy(f32),
    UpdateThresholds { occupied: i32, vacant: i32 },
    UpdateDebounce { occupied_ms: u32, vacant_ms: u32 },
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("invalid energy reading {0:?}")]
    InvalidEnergy(String),

    #[error("invalid calibration payload: {0}")]
    InvalidCalibration(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ThresholdsPayload {
    occupied: i32,
    vacant: i32,
}

#[derive(Debug, Deserialize)]
struct DebouncePayload {
    occupied_ms: u32,
    vacant_ms: u32,
}

impl EngineCommand {
    /// Plain-text float as published by the radar, e.g. `42.5`.
    pub fn energy_from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(payload)?.trim();
        match text.parse::<f32>() {
            Ok(energy) if energy.is_finite() => Ok(EngineCommand::Energy(energy)),
            _ => Err(PayloadError::InvalidEnergy(text.to_string())),
        }
    }

    pub fn thresholds_from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        let p: ThresholdsPayload = serde_json::from_slice(payload)?;
        Ok(EngineCommand::UpdateThresholds {
            occupied: p.occupied,
            vacant: p.vacant,
        })
    }

    pub fn debounce_from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        let p: DebouncePayload = serde_json::from_slice(payload)?;
        Ok(EngineCommand::UpdateDebounce {
            occupied_ms: p.occupied_ms,
            vacant_ms: p.vacant_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_payload() {
        assert_eq!(
            EngineCommand::energy_from_payload(b" 42.5\n").unwrap(),
            EngineCommand::Energy(42.5)
        );
        assert!(matches!(
            EngineCommand::energy_from_payload(b"unavailable"),
            Err(PayloadError::InvalidEnergy(_))
        ));
        assert!(matches!(
            EngineCommand::energy_from_payload(b"NaN"),
            Err(PayloadError::InvalidEnergy(_))
        ));
        assert!(matches!(
            EngineCommand::energy_from_payload(&[0xff, 0xfe]),
            Err(PayloadError::NotUtf8(_))
        ));
    }

    #[test]
    fn test_calibration_payloads() {
        assert_eq!(
            EngineCommand::thresholds_from_payload(br#"{"occupied": 60, "vacant": 25}"#).unwrap(),
            EngineCommand::UpdateThresholds {
                occupied: 60,
                vacant: 25
            }
        );
        assert_eq!(
            EngineCommand::debounce_from_payload(br#"{"occupied_ms": 1500, "vacant_ms": 8000}"#)
                .unwrap(),
            EngineCommand::UpdateDebounce {
                occupied_ms: 1500,
                vacant_ms: 8000
            }
        );
        assert!(matches!(
            EngineCommand::thresholds_from_payload(br#"{"occupied": 60}"#),
            Err(PayloadError::InvalidCalibration(_))
        ));
        assert!(matches!(
            EngineCommand::debounce_from_payload(br#"{"occupied_ms": -5, "vacant_ms": 1}"#),
            Err(PayloadError::InvalidCalibration(_))
        ));
    }
}
