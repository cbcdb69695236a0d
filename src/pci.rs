//! PCI device address parsing.
//!
//! Format is `BB:DD.F`: two hex digits of bus, two of device, one of
//! function. Spec.md S6 also accepts `BB.DD.F` (a dot in place of the
//! colon, for fio-engine compatibility) and normalizes it to the colon
//! form before binding.

use crate::error::UnvmeError;
use std::fmt;

/// A parsed `BB:DD.F` PCI device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Parses a PCI address string, accepting either `BB:DD.F` or the
    /// fio-engine-compatible `BB.DD.F` alternative separator.
    pub fn parse(s: &str) -> Result<Self, UnvmeError> {
        let normalized = normalize_separator(s);
        let (bus_str, rest) = normalized
            .split_once(':')
            .ok_or_else(|| UnvmeError::InvalidPciAddress(s.to_string()))?;
        let (dev_str, func_str) = rest
            .split_once('.')
            .ok_or_else(|| UnvmeError::InvalidPciAddress(s.to_string()))?;

        if bus_str.len() != 2 || dev_str.len() != 2 || func_str.len() != 1 {
            return Err(UnvmeError::InvalidPciAddress(s.to_string()));
        }

        let bus = u8::from_str_radix(bus_str, 16)
            .map_err(|_| UnvmeError::InvalidPciAddress(s.to_string()))?;
        let device = u8::from_str_radix(dev_str, 16)
            .map_err(|_| UnvmeError::InvalidPciAddress(s.to_string()))?;
        let function = u8::from_str_radix(func_str, 16)
            .map_err(|_| UnvmeError::InvalidPciAddress(s.to_string()))?;

        Ok(PciAddress { bus, device, function })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

/// Replaces the first two `.` separators that stand in for `:`/`.` with
/// their canonical characters, leaving a well-formed `BB:DD.F` string (or
/// garbage, which `parse` rejects downstream).
fn normalize_separator(s: &str) -> String {
    if s.contains(':') {
        return s.to_string();
    }
    match s.split_once('.') {
        Some((bus, rest)) => format!("{bus}:{rest}"),
        None => s.to_string(),
    }
}
