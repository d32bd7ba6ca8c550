//! Register maps for supported motor families.
//!
//! Each supported family is described by a [`RegisterSchema`]: the named
//! registers of its control table with their address, width, access mode
//! and memory area. Schemas are immutable; [`RegisterSchema::for_model`]
//! builds each one once and hands out shared `Arc`s after that.
//!
//! | Tag            | Table                       | Goal position range |
//! |----------------|-----------------------------|---------------------|
//! | `X_SERIES`     | X-series Protocol 2.0       | 0..=4095            |
//! | `MX_SERIES`    | same as X-series            | 0..=4095            |
//! | `XL320`        | XL-320                      | 0..=1023            |
//! | `PRO_SERIES`   | not mapped                  |                     |
//! | `P_SERIES`     | not mapped                  |                     |
//! | `PRO_A_SERIES` | not mapped                  |                     |
//!
//! Families that are not mapped fail with
//! [`Error::UnsupportedModel`] rather than falling back to another table.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, LazyLock, Mutex};

use dxlbus_core::{Access, Area, Error, Result, Width};

/// Location and shape of one register in a control table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub address: u16,
    pub width: Width,
    pub access: Access,
    pub area: Area,
}

impl RegisterDescriptor {
    /// First address past the end of this register.
    pub fn end(&self) -> u16 {
        self.address + self.width.bytes() as u16
    }
}

/// A register table entry before the area is attached.
type Entry = (&'static str, u16, Width, Access);

const fn rw(name: &'static str, address: u16, width: Width) -> Entry {
    (name, address, width, Access::ReadWrite)
}

const fn ro(name: &'static str, address: u16, width: Width) -> Entry {
    (name, address, width, Access::ReadOnly)
}

use Width::{Four, One, Two};

const X_SERIES_EEPROM: &[Entry] = &[
    ro("ModelNumber", 0, Two),
    ro("ModelInformation", 2, Four),
    ro("FirmwareVersion", 6, One),
    rw("Id", 7, One),
    rw("BaudRate", 8, One),
    rw("ReturnDelayTime", 9, One),
    rw("DriveMode", 10, One),
    rw("OperatingMode", 11, One),
    rw("SecondaryId", 12, One),
    rw("ProtocolType", 13, One),
    rw("HomingOffset", 20, Four),
    rw("MovingThreshold", 24, Four),
    rw("TemperatureLimit", 31, One),
    rw("MaxVoltageLimit", 32, Two),
    rw("MinVoltageLimit", 34, Two),
    rw("PwmLimit", 36, Two),
    rw("VelocityLimit", 44, Four),
    rw("MaxPositionLimit", 48, Four),
    rw("MinPositionLimit", 52, Four),
    rw("StartupConfiguration", 60, One),
    rw("Shutdown", 63, One),
];

const X_SERIES_RAM: &[Entry] = &[
    rw("TorqueEnable", 64, One),
    rw("Led", 65, One),
    rw("StatusReturnLevel", 68, One),
    ro("RegisteredInstruction", 69, One),
    ro("HardwareErrorStatus", 70, One),
    rw("VelocityIGain", 76, Two),
    rw("VelocityPGain", 78, Two),
    rw("PositionDGain", 80, Two),
    rw("PositionIGain", 82, Two),
    rw("PositionPGain", 84, Two),
    rw("Feedforward2ndGain", 88, Two),
    rw("Feedforward1stGain", 90, Two),
    rw("BusWatchdog", 98, One),
    rw("GoalPwm", 100, Two),
    rw("GoalVelocity", 104, Four),
    rw("ProfileAcceleration", 108, Four),
    rw("ProfileVelocity", 112, Four),
    rw("GoalPosition", 116, Four),
    ro("RealtimeTick", 120, Two),
    ro("Moving", 122, One),
    ro("MovingStatus", 123, One),
    ro("PresentPwm", 124, Two),
    ro("PresentLoad", 126, Two),
    ro("PresentVelocity", 128, Four),
    ro("PresentPosition", 132, Four),
    ro("VelocityTrajectory", 136, Four),
    ro("PositionTrajectory", 140, Four),
    ro("PresentInputVoltage", 144, Two),
    ro("PresentTemperature", 146, One),
    ro("BackupReady", 147, One),
];

const XL320_EEPROM: &[Entry] = &[
    ro("ModelNumber", 0, Two),
    ro("FirmwareVersion", 2, One),
    rw("Id", 3, One),
    rw("BaudRate", 4, One),
    rw("ReturnDelayTime", 5, One),
    rw("CwAngleLimit", 6, Two),
    rw("CcwAngleLimit", 8, Two),
    rw("ControlMode", 11, One),
    rw("TemperatureLimit", 12, One),
    rw("MinVoltageLimit", 13, One),
    rw("MaxVoltageLimit", 14, One),
    rw("MaxTorque", 15, Two),
    rw("StatusReturnLevel", 17, One),
    rw("Shutdown", 18, One),
];

const XL320_RAM: &[Entry] = &[
    rw("TorqueEnable", 24, One),
    rw("Led", 25, One),
    rw("DGain", 27, One),
    rw("IGain", 28, One),
    rw("PGain", 29, One),
    rw("GoalPosition", 30, Two),
    // "Moving Speed" in the XL-320 manual.
    rw("GoalVelocity", 32, Two),
    rw("TorqueLimit", 35, Two),
    ro("PresentPosition", 37, Two),
    ro("PresentVelocity", 39, Two),
    ro("PresentLoad", 41, Two),
    ro("PresentVoltage", 45, One),
    ro("PresentTemperature", 46, One),
    ro("RegisteredInstruction", 47, One),
    ro("Moving", 49, One),
    ro("HardwareErrorStatus", 50, One),
    rw("Punch", 51, Two),
];

/// Family tags that are recognized but whose control tables are not mapped.
const UNMAPPED_FAMILIES: &[&str] = &["PRO_SERIES", "P_SERIES", "PRO_A_SERIES"];

static SCHEMAS: LazyLock<Mutex<HashMap<String, Arc<RegisterSchema>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Static register map of one motor model.
#[derive(Debug)]
pub struct RegisterSchema {
    model: String,
    /// Registers in ascending address order.
    registers: Vec<(&'static str, RegisterDescriptor)>,
    index: HashMap<&'static str, usize>,
    position_limits: RangeInclusive<i64>,
}

impl RegisterSchema {
    /// Build a schema from EEPROM and RAM tables.
    ///
    /// Fails if two registers share a name or overlap in address range.
    fn new(
        model: &str,
        eeprom: &[Entry],
        ram: &[Entry],
        position_limits: RangeInclusive<i64>,
    ) -> Result<Self> {
        let tagged = eeprom
            .iter()
            .map(|e| (e, Area::Eeprom))
            .chain(ram.iter().map(|e| (e, Area::Ram)));

        let mut registers: Vec<(&'static str, RegisterDescriptor)> = tagged
            .map(|(&(name, address, width, access), area)| {
                (
                    name,
                    RegisterDescriptor {
                        address,
                        width,
                        access,
                        area,
                    },
                )
            })
            .collect();
        registers.sort_by_key(|(_, d)| d.address);

        for pair in registers.windows(2) {
            let (prev_name, prev) = pair[0];
            let (next_name, next) = pair[1];
            if prev.end() > next.address {
                return Err(Error::InvalidParameter(format!(
                    "{model}: register {prev_name} overlaps {next_name}"
                )));
            }
        }

        let mut index = HashMap::with_capacity(registers.len());
        for (i, (name, _)) in registers.iter().enumerate() {
            if index.insert(*name, i).is_some() {
                return Err(Error::InvalidParameter(format!(
                    "{model}: register {name} defined twice"
                )));
            }
        }

        Ok(RegisterSchema {
            model: model.to_string(),
            registers,
            index,
            position_limits,
        })
    }

    /// Shared schema for a model tag.
    ///
    /// Tags are matched case-insensitively. Unknown tags and families whose
    /// table is not mapped yet both fail with [`Error::UnsupportedModel`].
    /// Each schema is built on first use; later calls return the same `Arc`.
    pub fn for_model(tag: &str) -> Result<Arc<Self>> {
        let tag = tag.trim().to_ascii_uppercase();
        let mut cache = SCHEMAS.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(schema) = cache.get(&tag) {
            return Ok(Arc::clone(schema));
        }
        let schema = Arc::new(RegisterSchema::build(&tag)?);
        cache.insert(tag, Arc::clone(&schema));
        Ok(schema)
    }

    fn build(tag: &str) -> Result<Self> {
        match tag {
            "X_SERIES" | "MX_SERIES" => {
                RegisterSchema::new(tag, X_SERIES_EEPROM, X_SERIES_RAM, 0..=4095)
            }
            "XL320" => RegisterSchema::new(tag, XL320_EEPROM, XL320_RAM, 0..=1023),
            t if UNMAPPED_FAMILIES.contains(&t) => Err(Error::UnsupportedModel(format!(
                "{tag} (control table not mapped)"
            ))),
            _ => Err(Error::UnsupportedModel(tag.to_string())),
        }
    }

    /// The model tag this schema was built for.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Look up a register by name.
    pub fn describe(&self, name: &str) -> Result<RegisterDescriptor> {
        self.index
            .get(name)
            .map(|&i| self.registers[i].1)
            .ok_or_else(|| Error::UnknownRegister {
                model: self.model.clone(),
                register: name.to_string(),
            })
    }

    /// All registers in ascending address order.
    pub fn registers(&self) -> impl Iterator<Item = (&'static str, RegisterDescriptor)> + '_ {
        self.registers.iter().copied()
    }

    /// Registers of one area in ascending address order.
    pub fn registers_in(
        &self,
        area: Area,
    ) -> impl Iterator<Item = (&'static str, RegisterDescriptor)> + '_ {
        self.registers().filter(move |(_, d)| d.area == area)
    }

    /// Smallest address window `(start, length)` covering every register
    /// of `area`, or `None` if the area has no registers.
    pub fn span(&self, area: Area) -> Option<(u16, u16)> {
        let mut regs = self.registers_in(area);
        let first = regs.next()?;
        let last = regs.last().unwrap_or(first);
        let start = first.1.address;
        Some((start, last.1.end() - start))
    }

    /// Valid goal position range for this family.
    pub fn position_limits(&self) -> RangeInclusive<i64> {
        self.position_limits.clone()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

/// Model tags with a mapped register table.
pub fn supported_models() -> &'static [&'static str] {
    &["X_SERIES", "MX_SERIES", "XL320"]
}

/// Map a model number reported by ping to its family tag.
///
/// Returns the tag for unmapped families too, so callers can report
/// exactly which family was found.
pub fn model_tag_for_number(model_number: u16) -> Option<&'static str> {
    let tag = match model_number {
        // XH430, XM430, XL430, XC430, 2XL430, 2XC430
        1000 | 1010 | 1020 | 1030 | 1040 | 1050 | 1060 | 1070 | 1080 | 1090 | 1160 => "X_SERIES",
        // XH540, XM540, XW540
        1100 | 1110 | 1120 | 1130 | 1140 | 1150 | 1170 | 1180 => "X_SERIES",
        // XL330, XC330
        1190 | 1200 | 1210 | 1220 | 1230 | 1240 => "X_SERIES",
        // MX-28, MX-64, MX-106 on Protocol 2.0 firmware
        30 | 311 | 321 => "MX_SERIES",
        350 => "XL320",
        35072 | 37896 | 37928 | 38152 | 38176 | 43288 | 46096 | 46352 | 51200 | 53768
        | 54024 => "PRO_SERIES",
        43289 | 46097 | 46353 | 51201 | 53769 | 54025 => "PRO_A_SERIES",
        2000 | 2010 | 2020 | 2100 | 2110 | 2120 => "P_SERIES",
        _ => return None,
    };
    Some(tag)
}
