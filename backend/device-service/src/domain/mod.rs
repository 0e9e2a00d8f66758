//! Device aggregate.
//!
//! The aggregate is an immutable value: transitions return a new `Device`
//! and the repository persists it under optimistic concurrency. The
//! version is bumped by the persisted `UPDATE`, not by the transition
//! itself.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

static MAC_HEX: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-f]{12}$").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Retired,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "active" => Ok(DeviceStatus::Active),
            "retired" => Ok(DeviceStatus::Retired),
            other => Err(AppError::Database(format!("unknown device status '{other}'"))),
        }
    }
}

/// Normalize a MAC address to its canonical form: lowercase,
/// colon-separated, six groups of two hex digits. Accepts `:`/`-`
/// separated or bare-hex input. Idempotent for any valid input.
pub fn normalize_mac(value: &str) -> Result<String, AppError> {
    let raw = value.trim().to_lowercase();
    if raw.is_empty() {
        return Err(AppError::Validation("MAC address is required".into()));
    }
    let raw = raw.replace([':', '-'], "");
    if !MAC_HEX.is_match(&raw) {
        return Err(AppError::Validation("Invalid MAC address format".into()));
    }
    Ok((0..12)
        .step_by(2)
        .map(|i| &raw[i..i + 2])
        .collect::<Vec<_>>()
        .join(":"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub mac_address: String,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl Device {
    /// A freshly registered device: active, version 1.
    pub fn register(tenant_id: Uuid, mac_address: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            mac_address,
            status: DeviceStatus::Active,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Transition to retired. No-op transitions and empty reasons are
    /// rejected; both legs of the lifecycle require an audit reason.
    pub fn retire(&self, reason: &str, now: DateTime<Utc>) -> Result<Device, AppError> {
        if self.status == DeviceStatus::Retired {
            return Err(AppError::Validation("Device already retired".into()));
        }
        if reason.trim().is_empty() {
            return Err(AppError::Validation("Retire reason is required".into()));
        }
        Ok(Device {
            status: DeviceStatus::Retired,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Transition back to active.
    pub fn activate(&self, reason: &str, now: DateTime<Utc>) -> Result<Device, AppError> {
        if self.status == DeviceStatus::Active {
            return Err(AppError::Validation("Device already active".into()));
        }
        if reason.trim().is_empty() {
            return Err(AppError::Validation("Activation reason is required".into()));
        }
        Ok(Device {
            status: DeviceStatus::Active,
            updated_at: now,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device(status: DeviceStatus) -> Device {
        let mut d = Device::register(Uuid::new_v4(), "aa:bb:cc:dd:ee:ff".into(), Utc::now());
        d.status = status;
        d
    }

    #[test]
    fn normalizes_colon_dash_and_bare_input() {
        for input in ["AA:BB:CC:DD:EE:FF", "aa-bb-cc-dd-ee-ff", "AABBCCDDEEFF", " aabbccddeeff "] {
            assert_eq!(normalize_mac(input).unwrap(), "aa:bb:cc:dd:ee:ff");
        }
    }

    #[test]
    fn rejects_malformed_macs() {
        for input in ["", "   ", "aa:bb:cc:dd:ee", "aa:bb:cc:dd:ee:ff:00", "zz:bb:cc:dd:ee:ff", "aabbccddeef"] {
            assert!(matches!(
                normalize_mac(input),
                Err(AppError::Validation(_))
            ));
        }
    }

    #[test]
    fn retire_requires_reason_and_forbids_noop() {
        let active = device(DeviceStatus::Active);
        assert!(active.retire("  ", Utc::now()).is_err());

        let retired = device(DeviceStatus::Retired);
        assert!(matches!(
            retired.retire("end of life", Utc::now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn activate_requires_reason_and_forbids_noop() {
        let retired = device(DeviceStatus::Retired);
        assert!(retired.activate("", Utc::now()).is_err());

        let active = device(DeviceStatus::Active);
        assert!(matches!(
            active.activate("bring back", Utc::now()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn transitions_keep_identity_and_version() {
        let active = device(DeviceStatus::Active);
        let now = Utc::now();
        let retired = active.retire("end of life", now).unwrap();

        assert_eq!(retired.id, active.id);
        assert_eq!(retired.created_at, active.created_at);
        assert_eq!(retired.version, active.version);
        assert_eq!(retired.updated_at, now);
        assert_eq!(retired.status, DeviceStatus::Retired);
    }

    proptest! {
        /// normalize(normalize(x)) == normalize(x) for every valid input.
        #[test]
        fn normalization_is_idempotent(raw in "[0-9a-fA-F]{12}") {
            let once = normalize_mac(&raw).unwrap();
            let twice = normalize_mac(&once).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn canonical_form_shape(raw in "[0-9a-fA-F]{12}") {
            let mac = normalize_mac(&raw).unwrap();
            prop_assert_eq!(mac.len(), 17);
            prop_assert!(mac.split(':').count() == 6);
            prop_assert!(mac.chars().all(|c| c == ':' || c.is_ascii_hexdigit()));
            prop_assert!(!mac.chars().any(|c| c.is_ascii_uppercase()));
        }
    }
}
