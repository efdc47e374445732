//! CPU, memory, and paired resource quantity types.
//!
//! CPU is stored as integer millicores and memory as integer bytes, so sums
//! over arbitrary pod sets stay exact and test expectations stay stable.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::QuantityError;

/// A CPU quantity in integer millicores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cpu(u64);

impl Cpu {
    /// Zero CPU.
    pub const ZERO: Cpu = Cpu(0);

    /// Creates a quantity from whole cores.
    #[must_use]
    pub const fn from_cores(cores: u64) -> Self {
        Self(cores * 1000)
    }

    /// Creates a quantity from millicores.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the value in millicores.
    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.0
    }

    /// Returns true if the quantity is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Subtracts, clamping at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Cpu) -> Cpu {
        Cpu(self.0.saturating_sub(other.0))
    }

    /// Number of `per_node`-sized units needed to cover this quantity,
    /// rounded up.
    ///
    /// Panics if `per_node` is zero; callers filter out zero capacities.
    #[must_use]
    pub const fn ceil_div(self, per_node: Cpu) -> u64 {
        self.0.div_ceil(per_node.0)
    }

    /// Scales by the exact ratio `numer / denom`, rounding up.
    ///
    /// Intermediates are 128-bit so the scaling never overflows or drifts.
    #[must_use]
    pub fn scale_ceil(self, numer: u64, denom: u64) -> Cpu {
        let scaled = (self.0 as u128 * numer as u128).div_ceil(denom as u128);
        Cpu(scaled as u64)
    }

    /// Parses an orchestrator CPU quantity: whole or decimal cores
    /// (`"2"`, `"0.5"`) or integer millicores (`"500m"`).
    pub fn parse(s: &str) -> Result<Self, QuantityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        if let Some(millis) = s.strip_suffix('m') {
            let value: u64 = millis
                .parse()
                .map_err(|_| QuantityError::InvalidValue(s.to_string()))?;
            return Ok(Cpu(value));
        }

        let (numerator, frac_len) = parse_decimal(s)?;
        if frac_len > 3 {
            // Sub-millicore precision cannot be represented.
            return Err(QuantityError::ExcessPrecision(s.to_string()));
        }
        let millis = numerator * 10u128.pow(3 - frac_len);
        Ok(Cpu(millis as u64))
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl FromStr for Cpu {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cpu::parse(s)
    }
}

impl Add for Cpu {
    type Output = Cpu;

    fn add(self, other: Cpu) -> Cpu {
        Cpu(self.0.saturating_add(other.0))
    }
}

impl AddAssign for Cpu {
    fn add_assign(&mut self, other: Cpu) {
        *self = *self + other;
    }
}

impl Mul<u64> for Cpu {
    type Output = Cpu;

    fn mul(self, count: u64) -> Cpu {
        Cpu(self.0.saturating_mul(count))
    }
}

impl Sum for Cpu {
    fn sum<I: Iterator<Item = Cpu>>(iter: I) -> Cpu {
        iter.fold(Cpu::ZERO, Add::add)
    }
}

/// A memory quantity in integer bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Memory(u64);

impl Memory {
    /// Zero memory.
    pub const ZERO: Memory = Memory(0);

    /// Creates a quantity from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Creates a quantity from mebibytes.
    #[must_use]
    pub const fn from_mebibytes(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Returns the value in bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.0
    }

    /// Returns true if the quantity is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Subtracts, clamping at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Memory) -> Memory {
        Memory(self.0.saturating_sub(other.0))
    }

    /// Number of `per_node`-sized units needed to cover this quantity,
    /// rounded up.
    ///
    /// Panics if `per_node` is zero; callers filter out zero capacities.
    #[must_use]
    pub const fn ceil_div(self, per_node: Memory) -> u64 {
        self.0.div_ceil(per_node.0)
    }

    /// Scales by the exact ratio `numer / denom`, rounding up.
    #[must_use]
    pub fn scale_ceil(self, numer: u64, denom: u64) -> Memory {
        let scaled = (self.0 as u128 * numer as u128).div_ceil(denom as u128);
        Memory(scaled as u64)
    }

    /// Parses an orchestrator memory quantity: bare bytes, decimal SI
    /// suffixes `K/M/G/T`, or binary suffixes `Ki/Mi/Gi/Ti`. Decimal
    /// mantissas are allowed (`"2.5Gi"`, `"15.25Gi"`); sub-byte remainders
    /// truncate toward zero.
    pub fn parse(s: &str) -> Result<Self, QuantityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let split = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
        let (mantissa, suffix) = s.split_at(split);

        let scale: u128 = match suffix.to_ascii_lowercase().as_str() {
            "" => 1,
            "k" => 1000,
            "m" => 1000 * 1000,
            "g" => 1000 * 1000 * 1000,
            "t" => 1000 * 1000 * 1000 * 1000,
            "ki" => 1024,
            "mi" => 1024 * 1024,
            "gi" => 1024 * 1024 * 1024,
            "ti" => 1024 * 1024 * 1024 * 1024,
            _ => {
                return Err(QuantityError::UnknownSuffix {
                    quantity: s.to_string(),
                    suffix: suffix.to_string(),
                })
            }
        };

        let (numerator, frac_len) = parse_decimal(mantissa)
            .map_err(|_| QuantityError::InvalidValue(s.to_string()))?;
        let bytes = numerator * scale / 10u128.pow(frac_len);
        Ok(Memory(bytes as u64))
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [
            (1024 * 1024 * 1024 * 1024, "Ti"),
            (1024 * 1024 * 1024, "Gi"),
            (1024 * 1024, "Mi"),
            (1024, "Ki"),
        ];
        if self.0 != 0 {
            for (scale, unit) in UNITS {
                if self.0 % scale == 0 {
                    return write!(f, "{}{}", self.0 / scale, unit);
                }
            }
        }
        write!(f, "{}", self.0)
    }
}

impl FromStr for Memory {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Memory::parse(s)
    }
}

impl Add for Memory {
    type Output = Memory;

    fn add(self, other: Memory) -> Memory {
        Memory(self.0.saturating_add(other.0))
    }
}

impl AddAssign for Memory {
    fn add_assign(&mut self, other: Memory) {
        *self = *self + other;
    }
}

impl Mul<u64> for Memory {
    type Output = Memory;

    fn mul(self, count: u64) -> Memory {
        Memory(self.0.saturating_mul(count))
    }
}

impl Sum for Memory {
    fn sum<I: Iterator<Item = Memory>>(iter: I) -> Memory {
        iter.fold(Memory::ZERO, Add::add)
    }
}

/// A CPU/memory pair, used for pod requests, node capacities, and sector
/// demand totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Resources {
    pub cpu: Cpu,
    pub memory: Memory,
}

impl Resources {
    /// Zero in both dimensions.
    pub const ZERO: Resources = Resources {
        cpu: Cpu::ZERO,
        memory: Memory::ZERO,
    };

    /// Creates a pair from the two dimensions.
    #[must_use]
    pub const fn new(cpu: Cpu, memory: Memory) -> Self {
        Self { cpu, memory }
    }

    /// Returns true if both dimensions are zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.cpu.is_zero() && self.memory.is_zero()
    }

    /// Returns true if this request fits within `capacity` in both
    /// dimensions.
    #[must_use]
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.cpu <= capacity.cpu && self.memory <= capacity.memory
    }

    /// Subtracts per dimension, clamping each at zero.
    #[must_use]
    pub fn saturating_sub(self, other: Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
        }
    }

    /// Scales both dimensions by the exact ratio `numer / denom`, rounding
    /// up.
    #[must_use]
    pub fn scale_ceil(self, numer: u64, denom: u64) -> Resources {
        Resources {
            cpu: self.cpu.scale_ceil(numer, denom),
            memory: self.memory.scale_ceil(numer, denom),
        }
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, other: Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, other: Resources) {
        *self = *self + other;
    }
}

impl Mul<u64> for Resources {
    type Output = Resources;

    fn mul(self, count: u64) -> Resources {
        Resources {
            cpu: self.cpu * count,
            memory: self.memory * count,
        }
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::ZERO, Add::add)
    }
}

/// Parses a non-negative decimal into `(int_digits * 10^frac_len +
/// frac_digits, frac_len)`.
fn parse_decimal(s: &str) -> Result<(u128, u32), QuantityError> {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(QuantityError::InvalidValue(s.to_string()));
    }
    let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(QuantityError::InvalidValue(s.to_string()));
    }

    let mut numerator: u128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| QuantityError::InvalidValue(s.to_string()))?
    };
    for b in frac_part.bytes() {
        numerator = numerator * 10 + u128::from(b - b'0');
    }
    Ok((numerator, frac_part.len() as u32))
}

// Quantities serialize as their canonical strings and deserialize from
// strings or plain numbers, matching what shows up in config files and
// orchestrator objects.

impl Serialize for Cpu {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cpu {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CpuVisitor;

        impl Visitor<'_> for CpuVisitor {
            type Value = Cpu;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a CPU quantity string or number of cores")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Cpu, E> {
                Cpu::parse(v).map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Cpu, E> {
                Ok(Cpu::from_cores(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Cpu, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(de::Error::custom(QuantityError::InvalidValue(
                        v.to_string(),
                    )));
                }
                let millis = (v * 1000.0).round();
                if (millis / 1000.0 - v).abs() > 1e-9 {
                    return Err(de::Error::custom(QuantityError::ExcessPrecision(
                        v.to_string(),
                    )));
                }
                Ok(Cpu::from_millis(millis as u64))
            }
        }

        deserializer.deserialize_any(CpuVisitor)
    }
}

impl Serialize for Memory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Memory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MemoryVisitor;

        impl Visitor<'_> for MemoryVisitor {
            type Value = Memory;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a memory quantity string or number of bytes")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Memory, E> {
                Memory::parse(v).map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Memory, E> {
                Ok(Memory::from_bytes(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Memory, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(de::Error::custom(QuantityError::InvalidValue(
                        v.to_string(),
                    )));
                }
                Ok(Memory::from_bytes(v as u64))
            }
        }

        deserializer.deserialize_any(MemoryVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_cores_and_millis() {
        assert_eq!(Cpu::parse("2").unwrap(), Cpu::from_cores(2));
        assert_eq!(Cpu::parse("0.5").unwrap(), Cpu::from_millis(500));
        assert_eq!(Cpu::parse("500m").unwrap(), Cpu::from_millis(500));
        assert_eq!(Cpu::parse("1500m").unwrap(), Cpu::from_millis(1500));
        assert_eq!(Cpu::parse("2.25").unwrap(), Cpu::from_millis(2250));
        assert_eq!(Cpu::parse("0").unwrap(), Cpu::ZERO);
    }

    #[test]
    fn test_parse_cpu_rejects_garbage() {
        assert!(matches!(Cpu::parse(""), Err(QuantityError::Empty)));
        assert!(Cpu::parse("abc").is_err());
        assert!(Cpu::parse("1.5.2").is_err());
        assert!(Cpu::parse("-1").is_err());
        assert!(matches!(
            Cpu::parse("0.0005"),
            Err(QuantityError::ExcessPrecision(_))
        ));
    }

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(Memory::parse("1024").unwrap(), Memory::from_bytes(1024));
        assert_eq!(Memory::parse("1Ki").unwrap(), Memory::from_bytes(1024));
        assert_eq!(Memory::parse("1K").unwrap(), Memory::from_bytes(1000));
        assert_eq!(
            Memory::parse("1500Mi").unwrap(),
            Memory::from_mebibytes(1500)
        );
        assert_eq!(
            Memory::parse("2G").unwrap(),
            Memory::from_bytes(2_000_000_000)
        );
        assert_eq!(
            Memory::parse("2.5Gi").unwrap(),
            Memory::from_bytes(2_684_354_560)
        );
        assert_eq!(
            Memory::parse("15.25Gi").unwrap(),
            Memory::from_bytes(16_374_562_816)
        );
    }

    #[test]
    fn test_parse_memory_rejects_unknown_suffix() {
        assert!(matches!(
            Memory::parse("5Qi"),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert!(Memory::parse("Gi").is_err());
        assert!(matches!(Memory::parse(""), Err(QuantityError::Empty)));
    }

    #[test]
    fn test_format_round_trips_preserve_value() {
        for input in ["500m", "2", "0.5", "3"] {
            let parsed = Cpu::parse(input).unwrap();
            assert_eq!(Cpu::parse(&parsed.to_string()).unwrap(), parsed);
        }
        for input in ["1024", "2.5Gi", "15.25Gi", "1500Mi", "3G", "777"] {
            let parsed = Memory::parse(input).unwrap();
            assert_eq!(Memory::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn test_canonical_formatting() {
        assert_eq!(Cpu::from_cores(2).to_string(), "2");
        assert_eq!(Cpu::from_millis(500).to_string(), "500m");
        assert_eq!(Memory::parse("2.5Gi").unwrap().to_string(), "2560Mi");
        assert_eq!(Memory::from_mebibytes(1024).to_string(), "1Gi");
        assert_eq!(Memory::from_bytes(1025).to_string(), "1025");
        assert_eq!(Memory::ZERO.to_string(), "0");
    }

    #[test]
    fn test_ceil_div() {
        let per_node = Memory::parse("58.5Gi").unwrap();
        let demand = Memory::parse("180Gi").unwrap();
        assert_eq!(demand.ceil_div(per_node), 4);

        assert_eq!(Cpu::ZERO.ceil_div(Cpu::from_cores(4)), 0);
        assert_eq!(Cpu::from_millis(1).ceil_div(Cpu::from_cores(4)), 1);
        assert_eq!(Cpu::from_cores(8).ceil_div(Cpu::from_cores(4)), 2);
    }

    #[test]
    fn test_scale_ceil_is_exact() {
        // 20Gi * 1.2 == 24Gi exactly.
        let inflated = Memory::parse("20Gi").unwrap().scale_ceil(1200, 1000);
        assert_eq!(inflated, Memory::parse("24Gi").unwrap());

        let inflated = Cpu::from_cores(3).scale_ceil(1200, 1000);
        assert_eq!(inflated, Cpu::from_millis(3600));

        // Identity ratio changes nothing.
        let q = Cpu::from_millis(777);
        assert_eq!(q.scale_ceil(1000, 1000), q);
    }

    #[test]
    fn test_resources_arithmetic() {
        let a = Resources::new(Cpu::from_cores(1), Memory::from_mebibytes(512));
        let b = Resources::new(Cpu::from_millis(500), Memory::from_mebibytes(256));
        let sum = a + b;
        assert_eq!(sum.cpu, Cpu::from_millis(1500));
        assert_eq!(sum.memory, Memory::from_mebibytes(768));

        assert!(b.fits_within(&a));
        assert!(!a.fits_within(&b));

        let diff = a.saturating_sub(sum);
        assert!(diff.is_zero());

        let doubled = b * 2;
        assert_eq!(doubled.cpu, Cpu::from_cores(1));
    }

    #[test]
    fn test_serde_round_trip() {
        let cpu: Cpu = serde_json::from_str("\"750m\"").unwrap();
        assert_eq!(cpu, Cpu::from_millis(750));
        let cpu: Cpu = serde_json::from_str("2").unwrap();
        assert_eq!(cpu, Cpu::from_cores(2));
        let cpu: Cpu = serde_json::from_str("1.5").unwrap();
        assert_eq!(cpu, Cpu::from_millis(1500));

        let mem: Memory = serde_json::from_str("\"2.5Gi\"").unwrap();
        assert_eq!(mem, Memory::from_bytes(2_684_354_560));
        let mem: Memory = serde_json::from_str("4096").unwrap();
        assert_eq!(mem, Memory::from_bytes(4096));

        assert_eq!(serde_json::to_string(&Cpu::from_millis(250)).unwrap(), "\"250m\"");
        assert_eq!(
            serde_json::to_string(&Memory::from_mebibytes(2560)).unwrap(),
            "\"2560Mi\""
        );
    }
}
