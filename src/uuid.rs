//! Profile UUIDs and helpers to use them.

use std::fmt::{Display, Formatter};

/// The raw byte representation of a 128-bit service UUID.
pub type Uuid128Bit = [u8; 16];

// Profile uuids relevant to the headset service.
pub const HSP: &str = "00001108-0000-1000-8000-00805F9B34FB";
pub const HSP_AG: &str = "00001112-0000-1000-8000-00805F9B34FB";
pub const HFP: &str = "0000111E-0000-1000-8000-00805F9B34FB";
pub const HFP_AG: &str = "0000111F-0000-1000-8000-00805F9B34FB";

/// Wraps a reference of Uuid128Bit for formatting in the canonical
/// 8-4-4-4-12 shape.
pub struct UuidWrapper<'a>(pub &'a Uuid128Bit);

impl<'a> Display for UuidWrapper<'a> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let uuid = self.0;
        for (i, b) in uuid.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

pub struct UuidHelper {}

impl UuidHelper {
    /// Converts a UUID string in the 8-4-4-4-12 shape to its raw bytes.
    /// Returns None when the string is malformed.
    pub fn from_string<S: Into<String>>(raw: S) -> Option<Uuid128Bit> {
        let raw: String = raw.into();

        let uuid = raw.chars().filter(|c| *c != '-').collect::<String>();
        if uuid.len() != 32 {
            return None;
        }

        let mut parsed: Uuid128Bit = [0; 16];
        for i in 0..16 {
            parsed[i] = match u8::from_str_radix(&uuid[i * 2..i * 2 + 2], 16) {
                Ok(b) => b,
                Err(_) => {
                    return None;
                }
            };
        }

        Some(parsed)
    }

    /// Checks whether any of the remote device's service UUIDs identifies a
    /// headset (HSP or HFP in the HF role).
    pub fn contains_headset_uuid(uuids: &[Uuid128Bit]) -> bool {
        let headset_uuids =
            [UuidHelper::from_string(HSP).unwrap(), UuidHelper::from_string(HFP).unwrap()];
        uuids.iter().any(|uuid| headset_uuids.contains(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string_malformed() {
        assert!(UuidHelper::from_string("").is_none());
        assert!(UuidHelper::from_string("0000").is_none());
        assert!(UuidHelper::from_string("0000110B-0000-1000-8000-00805F9B34F").is_none());
        assert!(UuidHelper::from_string("0000110z-0000-1000-8000-00805F9B34FB").is_none());
    }

    #[test]
    fn from_string_roundtrip() {
        let parsed = UuidHelper::from_string(HFP).unwrap();
        assert_eq!(HFP.to_lowercase(), format!("{}", UuidWrapper(&parsed)));
    }

    #[test]
    fn headset_uuid_detection() {
        let hfp = UuidHelper::from_string(HFP).unwrap();
        let hsp = UuidHelper::from_string(HSP).unwrap();
        let ag = UuidHelper::from_string(HFP_AG).unwrap();

        assert!(UuidHelper::contains_headset_uuid(&[hfp]));
        assert!(UuidHelper::contains_headset_uuid(&[ag, hsp]));
        assert!(!UuidHelper::contains_headset_uuid(&[ag]));
        assert!(!UuidHelper::contains_headset_uuid(&[]));
    }
}
