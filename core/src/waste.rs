//! Waste-ink counter arithmetic.
//!
//! Counters are little-endian register pairs. Models with a three-register
//! group keep a SHOWN and a REAL counter; firmware raises SHOWN to the larger
//! of the two on every print job or maintenance event, so the effective value
//! is their maximum.

use crate::error::Error;
use crate::model::WasteLayout;

/// `registers[0]` is the low byte, `registers[1]` the high byte.
pub fn raw_value(registers: [u8; 2]) -> u32 {
    u32::from(u16::from_le_bytes(registers))
}

/// Never clamped: a counter may run past its nominal full scale.
pub fn percentage(raw: u32, total: Option<f64>) -> Option<f64> {
    total.map(|total| f64::from(raw) / total * 100.0)
}

pub fn calibrate(raw: u32, observed_percentage: f64) -> Result<f64, Error> {
    if !observed_percentage.is_finite() || observed_percentage <= 0.0 {
        return Err(Error::invalid_parameter(
            "observed_percentage",
            format!("{observed_percentage} must be a positive percentage"),
        ));
    }
    Ok(f64::from(raw) / (observed_percentage / 100.0))
}

pub fn reconcile(shown: u32, real: u32) -> u32 {
    shown.max(real)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasteCounter {
    pub shown: u32,
    pub real: Option<u32>,
}

impl WasteCounter {
    pub fn effective(&self) -> u32 {
        match self.real {
            Some(real) => reconcile(self.shown, real),
            None => self.shown,
        }
    }
}

/// Combines register values read for `layout`; `value_of` maps an EEPROM
/// address to the byte read from it.
pub fn counter(layout: WasteLayout, mut value_of: impl FnMut(u8) -> u8) -> WasteCounter {
    match layout {
        WasteLayout::Pair { low, high } => WasteCounter {
            shown: raw_value([value_of(low), value_of(high)]),
            real: None,
        },
        WasteLayout::ShownReal {
            shown_low,
            high,
            real_low,
        } => {
            let high = value_of(high);
            WasteCounter {
                shown: raw_value([value_of(shown_low), high]),
                real: Some(raw_value([value_of(real_low), high])),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn raw_value_is_little_endian() {
        assert_eq!(raw_value([104, 26]), 6760);
        assert_ne!(raw_value([26, 104]), raw_value([104, 26]));
        assert_eq!(raw_value([0xFF, 0xFF]), 65535);
    }

    #[test]
    fn percentage_requires_calibration() {
        assert_eq!(percentage(6760, None), None);
        assert!(close(percentage(6760, Some(8450.0)).expect("pct"), 80.0));
    }

    #[test]
    fn percentage_is_not_clamped() {
        let over = percentage(20_000, Some(19_650.0)).expect("pct");
        assert!(over > 100.0);
    }

    #[test]
    fn calibrate_inverts_percentage() {
        assert!(close(calibrate(6760, 80.0).expect("total"), 8450.0));
        for raw in [1, 6760, 15_720, 65_535] {
            for pct in [0.5, 12.5, 80.0, 100.0] {
                let total = calibrate(raw, pct).expect("total");
                assert!(close(percentage(raw, Some(total)).expect("pct"), pct));
            }
        }
    }

    #[test]
    fn calibrate_rejects_non_positive_percentage() {
        assert!(matches!(
            calibrate(6760, 0.0),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(calibrate(6760, -5.0).is_err());
    }

    #[test]
    fn real_counter_wins_when_larger() {
        assert_eq!(reconcile(100, 150), 150);
        assert_eq!(reconcile(150, 100), 150);

        let registers: HashMap<u8, u8> = [(48, 100), (49, 0), (50, 150)].into_iter().collect();
        let layout = WasteLayout::ShownReal {
            shown_low: 48,
            high: 49,
            real_low: 50,
        };
        let counter = counter(layout, |oid| registers[&oid]);
        assert_eq!(counter.shown, 100);
        assert_eq!(counter.real, Some(150));
        assert_eq!(counter.effective(), 150);
    }

    #[test]
    fn pair_counter_has_no_real_half() {
        let counter = counter(WasteLayout::Pair { low: 20, high: 21 }, |oid| {
            if oid == 20 { 104 } else { 26 }
        });
        assert_eq!(counter.real, None);
        assert_eq!(counter.effective(), 6760);
    }
}
