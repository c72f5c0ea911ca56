//! Firmware and application personality types (§3, C9).

use std::fmt;
use std::str::FromStr;

/// The firmware personality baked into a GBL image, as declared by its
/// NabuCasa metadata's `fw_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareImageType {
    NcpUartHw,
    RcpUart802154,
    ZigbeeNcpRcpUart802154,
    ZigbeeRouterUartHw,
    GeckoBootloader,
}

impl FirmwareImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirmwareImageType::NcpUartHw => "NCP_UART_HW",
            FirmwareImageType::RcpUart802154 => "RCP_UART_802154",
            FirmwareImageType::ZigbeeNcpRcpUart802154 => "ZIGBEE_NCP_RCP_UART_802154",
            FirmwareImageType::ZigbeeRouterUartHw => "ZIGBEE_ROUTER_UART_HW",
            FirmwareImageType::GeckoBootloader => "GECKO_BOOTLOADER",
        }
    }
}

impl fmt::Display for FirmwareImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FirmwareImageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NCP_UART_HW" => FirmwareImageType::NcpUartHw,
            "RCP_UART_802154" => FirmwareImageType::RcpUart802154,
            "ZIGBEE_NCP_RCP_UART_802154" => FirmwareImageType::ZigbeeNcpRcpUart802154,
            "ZIGBEE_ROUTER_UART_HW" => FirmwareImageType::ZigbeeRouterUartHw,
            "GECKO_BOOTLOADER" => FirmwareImageType::GeckoBootloader,
            other => return Err(format!("unrecognized firmware image type '{other}'")),
        })
    }
}

/// The application personality currently running on the radio coprocessor,
/// as identified by [`crate::orchestrator::Flasher::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationType {
    GeckoBootloader,
    Cpc,
    Ezsp,
    Spinel,
}

impl ApplicationType {
    /// The firmware image types compatible with this running application,
    /// per the fixed mapping in §3. `GeckoBootloader` maps to nothing: a
    /// device parked in the bootloader always requires a cross-flash
    /// decision, never a same-type comparison.
    pub fn compatible_image_types(&self) -> &'static [FirmwareImageType] {
        match self {
            ApplicationType::Ezsp => &[FirmwareImageType::NcpUartHw],
            ApplicationType::Cpc => &[
                FirmwareImageType::RcpUart802154,
                FirmwareImageType::ZigbeeNcpRcpUart802154,
            ],
            ApplicationType::Spinel => &[FirmwareImageType::RcpUart802154],
            ApplicationType::GeckoBootloader => &[],
        }
    }

    pub fn is_compatible_with(&self, image_type: FirmwareImageType) -> bool {
        self.compatible_image_types().contains(&image_type)
    }
}

impl fmt::Display for ApplicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplicationType::GeckoBootloader => "gecko-bootloader",
            ApplicationType::Cpc => "cpc",
            ApplicationType::Ezsp => "ezsp",
            ApplicationType::Spinel => "spinel",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ezsp_maps_to_ncp_uart_hw_only() {
        assert!(ApplicationType::Ezsp.is_compatible_with(FirmwareImageType::NcpUartHw));
        assert!(!ApplicationType::Ezsp.is_compatible_with(FirmwareImageType::RcpUart802154));
    }

    #[test]
    fn bootloader_is_compatible_with_nothing() {
        assert!(ApplicationType::GeckoBootloader
            .compatible_image_types()
            .is_empty());
    }

    #[test]
    fn firmware_type_round_trips_through_display_and_fromstr() {
        for t in [
            FirmwareImageType::NcpUartHw,
            FirmwareImageType::RcpUart802154,
            FirmwareImageType::ZigbeeNcpRcpUart802154,
            FirmwareImageType::ZigbeeRouterUartHw,
            FirmwareImageType::GeckoBootloader,
        ] {
            assert_eq!(t.as_str().parse::<FirmwareImageType>().unwrap(), t);
        }
    }
}
