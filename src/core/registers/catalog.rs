//! Static register catalog
//!
//! TinyBMS Rev D register map: live telemetry, lifetime statistics and the
//! writable configuration groups. Sorted by address; [`by_address`] binary
//! searches, [`by_key`] scans.

use super::{Access, RegisterDescriptor, RegisterGroup, WireType};

const fn reg(
    address: u16,
    key: &'static str,
    label: &'static str,
    unit: &'static str,
    group: RegisterGroup,
    wire_type: WireType,
    scale: f64,
    access: Access,
    bounds: Option<(f64, f64)>,
) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit,
        group,
        wire_type,
        scale,
        access,
        bounds,
    }
}

const fn cell(address: u16, key: &'static str, label: &'static str) -> RegisterDescriptor {
    reg(
        address,
        key,
        label,
        "mV",
        RegisterGroup::LiveData,
        WireType::UInt16,
        1.0,
        Access::ReadOnly,
        None,
    )
}

/// Number of catalogued registers
pub const REGISTER_COUNT: usize = 50;

static CATALOG: [RegisterDescriptor; REGISTER_COUNT] = [
    // Live telemetry
    cell(0, "cell1_voltage_mv", "Cell 1 Voltage"),
    cell(1, "cell2_voltage_mv", "Cell 2 Voltage"),
    cell(2, "cell3_voltage_mv", "Cell 3 Voltage"),
    cell(3, "cell4_voltage_mv", "Cell 4 Voltage"),
    cell(4, "cell5_voltage_mv", "Cell 5 Voltage"),
    cell(5, "cell6_voltage_mv", "Cell 6 Voltage"),
    cell(6, "cell7_voltage_mv", "Cell 7 Voltage"),
    cell(7, "cell8_voltage_mv", "Cell 8 Voltage"),
    cell(8, "cell9_voltage_mv", "Cell 9 Voltage"),
    cell(9, "cell10_voltage_mv", "Cell 10 Voltage"),
    cell(10, "cell11_voltage_mv", "Cell 11 Voltage"),
    cell(11, "cell12_voltage_mv", "Cell 12 Voltage"),
    cell(12, "cell13_voltage_mv", "Cell 13 Voltage"),
    cell(13, "cell14_voltage_mv", "Cell 14 Voltage"),
    cell(14, "cell15_voltage_mv", "Cell 15 Voltage"),
    cell(15, "cell16_voltage_mv", "Cell 16 Voltage"),
    reg(32, "lifetime_counter_s", "Lifetime Counter", "s",
        RegisterGroup::Statistics, WireType::UInt32, 1.0, Access::ReadOnly, None),
    reg(36, "pack_voltage_v", "Pack Voltage", "V",
        RegisterGroup::LiveData, WireType::Float, 1.0, Access::ReadOnly, None),
    reg(38, "pack_current_a", "Pack Current", "A",
        RegisterGroup::LiveData, WireType::Float, 1.0, Access::ReadOnly, None),
    reg(40, "min_cell_voltage_mv", "Min Cell Voltage", "mV",
        RegisterGroup::LiveData, WireType::UInt16, 1.0, Access::ReadOnly, None),
    reg(41, "max_cell_voltage_mv", "Max Cell Voltage", "mV",
        RegisterGroup::LiveData, WireType::UInt16, 1.0, Access::ReadOnly, None),
    reg(42, "ext_temp_sensor1_c", "External Temp Sensor 1", "°C",
        RegisterGroup::LiveData, WireType::Int16, 0.1, Access::ReadOnly, None),
    reg(43, "ext_temp_sensor2_c", "External Temp Sensor 2", "°C",
        RegisterGroup::LiveData, WireType::Int16, 0.1, Access::ReadOnly, None),
    reg(45, "state_of_health_pct", "State Of Health", "%",
        RegisterGroup::LiveData, WireType::UInt16, 0.002, Access::ReadOnly, None),
    reg(46, "state_of_charge_pct", "State Of Charge", "%",
        RegisterGroup::LiveData, WireType::UInt32, 0.000001, Access::ReadOnly, None),
    reg(48, "internal_temperature_c", "Internal Temperature", "°C",
        RegisterGroup::LiveData, WireType::Int16, 0.1, Access::ReadOnly, None),
    reg(50, "online_status", "Online Status", "",
        RegisterGroup::LiveData, WireType::UInt16, 1.0, Access::ReadOnly, None),
    reg(51, "balancing_decision", "Balancing Decision Bits", "",
        RegisterGroup::LiveData, WireType::UInt16, 1.0, Access::ReadOnly, None),
    reg(52, "real_balancing", "Real Balancing Bits", "",
        RegisterGroup::LiveData, WireType::UInt16, 1.0, Access::ReadOnly, None),
    reg(100, "total_distance_km", "Total Distance", "km",
        RegisterGroup::Statistics, WireType::UInt32, 0.01, Access::ReadOnly, None),
    // Battery configuration
    reg(0x012C, "fully_charged_voltage_mv", "Fully Charged Voltage", "mV",
        RegisterGroup::Battery, WireType::UInt16, 1.0, Access::ReadWrite, Some((1200.0, 4500.0))),
    reg(0x012D, "fully_discharged_voltage_mv", "Fully Discharged Voltage", "mV",
        RegisterGroup::Battery, WireType::UInt16, 1.0, Access::ReadWrite, Some((1000.0, 3500.0))),
    reg(0x012F, "early_balancing_threshold_mv", "Early Balancing Threshold", "mV",
        RegisterGroup::Battery, WireType::UInt16, 1.0, Access::ReadWrite, Some((1000.0, 4500.0))),
    reg(0x0130, "charge_finished_current_ma", "Charge Finished Current", "mA",
        RegisterGroup::Battery, WireType::UInt16, 1.0, Access::ReadWrite, Some((100.0, 5000.0))),
    reg(0x0131, "peak_discharge_current_a", "Peak Discharge Current Cutoff", "A",
        RegisterGroup::Battery, WireType::UInt16, 1.0, Access::ReadWrite, Some((1.0, 750.0))),
    reg(0x0132, "battery_capacity_ah", "Battery Capacity", "Ah",
        RegisterGroup::Battery, WireType::UInt16, 0.01, Access::ReadWrite, Some((0.1, 655.0))),
    reg(0x0133, "cell_count", "Number of Series Cells", "",
        RegisterGroup::Battery, WireType::UInt16, 1.0, Access::ReadWrite, Some((4.0, 16.0))),
    reg(0x0134, "allowed_disbalance_mv", "Allowed Cell Disbalance", "mV",
        RegisterGroup::Battery, WireType::UInt16, 1.0, Access::ReadWrite, Some((15.0, 100.0))),
    // Charger configuration
    reg(0x0136, "charger_startup_delay_s", "Charger Startup Delay", "s",
        RegisterGroup::Charger, WireType::UInt16, 1.0, Access::ReadWrite, Some((5.0, 60.0))),
    reg(0x0137, "charger_disable_delay_s", "Charger Disable Delay", "s",
        RegisterGroup::Charger, WireType::UInt16, 1.0, Access::ReadWrite, Some((0.0, 60.0))),
    // Safety configuration
    reg(0x013B, "overvoltage_cutoff_mv", "Over-voltage Cutoff", "mV",
        RegisterGroup::Safety, WireType::UInt16, 1.0, Access::ReadWrite, Some((1200.0, 4500.0))),
    reg(0x013C, "undervoltage_cutoff_mv", "Under-voltage Cutoff", "mV",
        RegisterGroup::Safety, WireType::UInt16, 1.0, Access::ReadWrite, Some((800.0, 3500.0))),
    reg(0x013D, "discharge_overcurrent_a", "Discharge Over-current Cutoff", "A",
        RegisterGroup::Safety, WireType::UInt16, 1.0, Access::ReadWrite, Some((1.0, 750.0))),
    reg(0x013E, "charge_overcurrent_a", "Charge Over-current Cutoff", "A",
        RegisterGroup::Safety, WireType::UInt16, 1.0, Access::ReadWrite, Some((1.0, 750.0))),
    reg(0x013F, "overheat_cutoff_c", "Overheat Cutoff", "°C",
        RegisterGroup::Safety, WireType::UInt16, 1.0, Access::ReadWrite, Some((20.0, 90.0))),
    reg(0x0140, "low_temp_charge_cutoff_c", "Low Temperature Charge Cutoff", "°C",
        RegisterGroup::Safety, WireType::Int16, 1.0, Access::ReadWrite, Some((-40.0, 10.0))),
    // Advanced configuration
    reg(0x0141, "charge_restart_level_pct", "Charge Restart Level", "%",
        RegisterGroup::Advanced, WireType::UInt16, 1.0, Access::ReadWrite, Some((60.0, 95.0))),
    reg(0x0142, "battery_max_cycles", "Battery Maximum Cycles", "",
        RegisterGroup::Advanced, WireType::UInt16, 1.0, Access::ReadWrite, Some((10.0, 65000.0))),
    reg(0x0156, "broadcast_interval", "Broadcast Interval", "",
        RegisterGroup::System, WireType::UInt16, 1.0, Access::ReadWrite, Some((0.0, 7.0))),
    reg(0x0157, "communication_protocol", "Communication Protocol", "",
        RegisterGroup::System, WireType::UInt16, 1.0, Access::ReadWrite, None),
];

/// The whole catalog, sorted by address
pub fn all() -> &'static [RegisterDescriptor] {
    &CATALOG
}

/// Look up a descriptor by register address
pub fn by_address(address: u16) -> Option<&'static RegisterDescriptor> {
    CATALOG
        .binary_search_by_key(&address, |desc| desc.address)
        .ok()
        .map(|index| &CATALOG[index])
}

/// Look up a descriptor by catalog key
pub fn by_key(key: &str) -> Option<&'static RegisterDescriptor> {
    CATALOG.iter().find(|desc| desc.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_sorted_and_unique() {
        for pair in CATALOG.windows(2) {
            assert!(
                pair[0].address < pair[1].address,
                "catalog must stay sorted by address ({:#06x} >= {:#06x})",
                pair[0].address,
                pair[1].address
            );
        }
    }

    #[test]
    fn test_keys_unique() {
        for (i, a) in CATALOG.iter().enumerate() {
            for b in &CATALOG[i + 1..] {
                assert_ne!(a.key, b.key);
            }
        }
    }

    #[test]
    fn test_lookup_by_address() {
        let desc = by_address(0x012C).expect("fully charged voltage is catalogued");
        assert_eq!(desc.key, "fully_charged_voltage_mv");
        assert!(by_address(0xFFFF).is_none());
    }

    #[test]
    fn test_lookup_by_key() {
        let desc = by_key("pack_voltage_v").expect("pack voltage is catalogued");
        assert_eq!(desc.address, 36);
        assert_eq!(desc.wire_type, WireType::Float);
        assert!(by_key("no_such_register").is_none());
    }

    #[test]
    fn test_live_data_is_read_only() {
        for desc in all() {
            if matches!(desc.group, RegisterGroup::LiveData | RegisterGroup::Statistics) {
                assert_eq!(desc.access, Access::ReadOnly, "{}", desc.key);
            }
        }
    }
}
