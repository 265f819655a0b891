use std::str::FromStr;

use serde::Serialize;
use serde_with::SerializeDisplay;
use thiserror::Error;

/// Errors returned when parsing a device address.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DeviceAddressError {
    #[error("device address `{raw}` contains no hexadecimal digits")]
    Empty { raw: String },
    #[error("device address `{raw}` contains invalid character `{character}`")]
    InvalidCharacter { raw: String, character: char },
}

/// Canonical hardware identifier for a device.
///
/// The normalised form drops `:` and `-` separators and lower-cases the hex
/// digits, so
/// `AA:BB:CC:DD:EE:FF` and `aabbccddeeff` name the same device. Platforms that
/// expose UUIDs instead of MAC addresses normalise the same way. Any other
/// character is rejected.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, derive_more::Display, SerializeDisplay,
)]
#[display("{_0}")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Returns the normalised address string.
    ///
    /// ```
    /// let address: microbot::DeviceAddress = "AA:BB:CC:DD:EE:FF".parse()?;
    /// assert_eq!("aabbccddeeff", address.as_str());
    /// # Ok::<(), microbot::DeviceAddressError>(())
    /// ```
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whether a raw platform address names this device.
    #[must_use]
    pub fn matches(&self, raw: &str) -> bool {
        normalise(raw).is_ok_and(|normalised| normalised == self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = DeviceAddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = normalise(value)?;
        if normalised.is_empty() {
            return Err(DeviceAddressError::Empty {
                raw: value.to_string(),
            });
        }
        Ok(Self(normalised))
    }
}

fn normalise(raw: &str) -> Result<String, DeviceAddressError> {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .map(|c| {
            if c.is_ascii_hexdigit() {
                Ok(c.to_ascii_lowercase())
            } else {
                Err(DeviceAddressError::InvalidCharacter {
                    raw: raw.to_string(),
                    character: c,
                })
            }
        })
        .collect()
}

/// A resolved, connectable MicroBot peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct FoundDevice {
    adapter_name: String,
    device_id: String,
    address: DeviceAddress,
    local_name: Option<String>,
    rssi: Option<i16>,
}

impl FoundDevice {
    /// Creates a resolved-device record.
    #[must_use]
    pub fn new(
        adapter_name: impl Into<String>,
        device_id: impl Into<String>,
        address: DeviceAddress,
        local_name: Option<String>,
        rssi: Option<i16>,
    ) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            device_id: device_id.into(),
            address,
            local_name,
            rssi,
        }
    }

    /// Returns the adapter name used to discover this device.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Returns the backend-specific peripheral identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the normalised device address.
    #[must_use]
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the RSSI observed during discovery, if present.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns a display name combining local name and address.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.local_name {
            Some(name) => format!("{name} ({})", self.address),
            None => self.address.to_string(),
        }
    }
}
