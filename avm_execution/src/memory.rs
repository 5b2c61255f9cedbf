//! The typed memory machine: a flat, indexable array of tagged field values.
//!
//! Every cell carries a [`MemoryTag`]; binary and unary opcodes operate only
//! on compatible tags, and fixed-width arithmetic that would leave its tag's
//! range fails with [`AvmError::Overflow`] rather than wrapping. Unset cells
//! read as `Field(0)`. Purely deterministic; no side effects beyond memory
//! contents.

use ethereum_types::{U256, U512};
use indexed_tree::hashing::field_modulus;
use serde::{Deserialize, Serialize};

use crate::errors::{AvmError, AvmResult};

/// Highest addressable memory offset (exclusive).
pub const MEMORY_SIZE: u64 = 1 << 32;

/// The type tag of a memory cell.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum MemoryTag {
    /// A single bit (booleans, comparison results).
    U1,
    /// An unsigned 8-bit integer.
    U8,
    /// An unsigned 16-bit integer.
    U16,
    /// An unsigned 32-bit integer.
    U32,
    /// An unsigned 64-bit integer.
    U64,
    /// An unsigned 128-bit integer.
    U128,
    /// A native field element.
    #[default]
    Field,
}

impl MemoryTag {
    /// The tag's bit width, or `None` for the native field.
    pub const fn bits(self) -> Option<usize> {
        match self {
            MemoryTag::U1 => Some(1),
            MemoryTag::U8 => Some(8),
            MemoryTag::U16 => Some(16),
            MemoryTag::U32 => Some(32),
            MemoryTag::U64 => Some(64),
            MemoryTag::U128 => Some(128),
            MemoryTag::Field => None,
        }
    }

    /// Whether `value` fits the tag's range.
    pub fn fits(self, value: U256) -> bool {
        match self.bits() {
            Some(bits) => value.bits() <= bits,
            None => value < field_modulus(),
        }
    }
}

/// A field element together with its type tag.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TaggedValue {
    /// The raw value (always within the tag's range).
    pub value: U256,
    /// The cell's tag.
    pub tag: MemoryTag,
}

impl TaggedValue {
    /// Constructs a tagged value, checking the tag's range.
    pub fn new(tag: MemoryTag, value: U256) -> AvmResult<Self> {
        if !tag.fits(value) {
            return Err(AvmError::Overflow { tag, value });
        }
        Ok(Self { value, tag })
    }

    /// A `Field`-tagged value (reduced into the field).
    pub fn field(value: U256) -> Self {
        Self {
            value: value % field_modulus(),
            tag: MemoryTag::Field,
        }
    }

    /// A `U1`-tagged boolean.
    pub fn bit(b: bool) -> Self {
        Self {
            value: U256::from(b as u8),
            tag: MemoryTag::U1,
        }
    }

    /// A `U32`-tagged value.
    pub fn u32_of(value: u32) -> Self {
        Self {
            value: U256::from(value),
            tag: MemoryTag::U32,
        }
    }

    /// A `U64`-tagged value.
    pub fn u64_of(value: u64) -> Self {
        Self {
            value: U256::from(value),
            tag: MemoryTag::U64,
        }
    }

    /// Re-tags the value, truncating into the target range (`Cast`
    /// semantics: bits beyond the target width are discarded; fields reduce
    /// modulo the field).
    pub fn cast(self, tag: MemoryTag) -> Self {
        let value = match tag.bits() {
            None => self.value % field_modulus(),
            Some(bits) => {
                let mask = (U256::one() << bits) - 1;
                self.value & mask
            }
        };
        Self { value, tag }
    }

    fn require_same_tag(self, other: Self) -> AvmResult<MemoryTag> {
        if self.tag != other.tag {
            return Err(AvmError::TagMismatch {
                expected: self.tag,
                found: other.tag,
            });
        }
        Ok(self.tag)
    }

    fn require_integral(self) -> AvmResult<usize> {
        self.tag.bits().ok_or(AvmError::TagMismatch {
            expected: MemoryTag::U128,
            found: self.tag,
        })
    }

    /// Tag-checked addition. Fixed-width overflow is an error; field
    /// addition wraps modulo the field.
    pub fn add(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        let value = match tag.bits() {
            None => {
                let (sum, _) = self.value.overflowing_add(other.value);
                sum % field_modulus()
            }
            Some(_) => {
                let sum = self
                    .value
                    .checked_add(other.value)
                    .ok_or(AvmError::Overflow {
                        tag,
                        value: self.value,
                    })?;
                if !tag.fits(sum) {
                    return Err(AvmError::Overflow { tag, value: sum });
                }
                sum
            }
        };
        Ok(Self { value, tag })
    }

    /// Tag-checked subtraction. Fixed-width underflow is an error; field
    /// subtraction wraps modulo the field.
    pub fn sub(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        let value = match tag.bits() {
            None => {
                let modulus = field_modulus();
                (self.value + modulus - other.value) % modulus
            }
            Some(_) => self
                .value
                .checked_sub(other.value)
                .ok_or(AvmError::Overflow {
                    tag,
                    value: other.value,
                })?,
        };
        Ok(Self { value, tag })
    }

    /// Tag-checked multiplication.
    pub fn mul(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        let value = match tag.bits() {
            None => {
                // Full-width product reduced modulo the field.
                let product = self.value.full_mul(other.value) % U512::from(field_modulus());
                U256::try_from(product).expect("reduced below 2^256")
            }
            Some(_) => {
                let product = self
                    .value
                    .checked_mul(other.value)
                    .ok_or(AvmError::Overflow {
                        tag,
                        value: self.value,
                    })?;
                if !tag.fits(product) {
                    return Err(AvmError::Overflow { tag, value: product });
                }
                product
            }
        };
        Ok(Self { value, tag })
    }

    /// Tag-checked integer division; division by zero yields zero.
    pub fn div(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        let value = if other.value.is_zero() {
            U256::zero()
        } else {
            self.value / other.value
        };
        Ok(Self { value, tag })
    }

    /// Bitwise AND; not defined on fields.
    pub fn and(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        self.require_integral()?;
        Ok(Self {
            value: self.value & other.value,
            tag,
        })
    }

    /// Bitwise OR; not defined on fields.
    pub fn or(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        self.require_integral()?;
        Ok(Self {
            value: self.value | other.value,
            tag,
        })
    }

    /// Bitwise XOR; not defined on fields.
    pub fn xor(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        self.require_integral()?;
        Ok(Self {
            value: self.value ^ other.value,
            tag,
        })
    }

    /// Bitwise NOT within the tag's width; not defined on fields.
    pub fn not(self) -> AvmResult<Self> {
        let bits = self.require_integral()?;
        let mask = (U256::one() << bits) - 1;
        Ok(Self {
            value: (!self.value) & mask,
            tag: self.tag,
        })
    }

    /// Left shift, truncating into the tag's width; not defined on fields.
    pub fn shl(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        let bits = self.require_integral()?;
        let shift = other.value.min(U256::from(bits)).low_u64() as usize;
        let value = if shift >= bits {
            U256::zero()
        } else {
            let mask = (U256::one() << bits) - 1;
            (self.value << shift) & mask
        };
        Ok(Self { value, tag })
    }

    /// Right shift; not defined on fields.
    pub fn shr(self, other: Self) -> AvmResult<Self> {
        let tag = self.require_same_tag(other)?;
        self.require_integral()?;
        let shift = other.value.min(U256::from(256u64)).low_u64() as usize;
        let value = if shift >= 256 {
            U256::zero()
        } else {
            self.value >> shift
        };
        Ok(Self { value, tag })
    }

    /// Tag-checked equality, yielding a `U1`.
    pub fn eq_op(self, other: Self) -> AvmResult<Self> {
        self.require_same_tag(other)?;
        Ok(Self::bit(self.value == other.value))
    }

    /// Tag-checked less-than, yielding a `U1`.
    pub fn lt(self, other: Self) -> AvmResult<Self> {
        self.require_same_tag(other)?;
        Ok(Self::bit(self.value < other.value))
    }

    /// Tag-checked less-than-or-equal, yielding a `U1`.
    pub fn lte(self, other: Self) -> AvmResult<Self> {
        self.require_same_tag(other)?;
        Ok(Self::bit(self.value <= other.value))
    }
}

/// The flat tagged memory of one call frame. Grows on demand up to
/// [`MEMORY_SIZE`]; unset cells read as `Field(0)`.
#[derive(Clone, Debug, Default)]
pub struct TaggedMemory {
    cells: Vec<Option<TaggedValue>>,
}

impl TaggedMemory {
    /// An empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_range(offset: u64, size: u64) -> AvmResult<()> {
        if offset.saturating_add(size) > MEMORY_SIZE {
            return Err(AvmError::MemoryOutOfBounds { offset, size });
        }
        Ok(())
    }

    /// Reads a cell; unset cells are `Field(0)`.
    pub fn read(&self, offset: u64) -> AvmResult<TaggedValue> {
        Self::check_range(offset, 1)?;
        Ok(self
            .cells
            .get(offset as usize)
            .copied()
            .flatten()
            .unwrap_or_default())
    }

    /// Reads a cell, requiring a specific tag.
    pub fn read_tagged(&self, offset: u64, expected: MemoryTag) -> AvmResult<TaggedValue> {
        let cell = self.read(offset)?;
        if cell.tag != expected {
            return Err(AvmError::TagMismatch {
                expected,
                found: cell.tag,
            });
        }
        Ok(cell)
    }

    /// Writes a cell.
    pub fn write(&mut self, offset: u64, value: TaggedValue) -> AvmResult<()> {
        Self::check_range(offset, 1)?;
        let offset = offset as usize;
        if offset >= self.cells.len() {
            self.cells.resize(offset + 1, None);
        }
        self.cells[offset] = Some(value);
        Ok(())
    }

    /// Reads a contiguous range of cells.
    pub fn read_slice(&self, offset: u64, size: u64) -> AvmResult<Vec<TaggedValue>> {
        Self::check_range(offset, size)?;
        (offset..offset + size).map(|i| self.read(i)).collect()
    }

    /// Writes a contiguous range of cells.
    pub fn write_slice(&mut self, offset: u64, values: &[TaggedValue]) -> AvmResult<()> {
        Self::check_range(offset, values.len() as u64)?;
        for (i, v) in values.iter().enumerate() {
            self.write(offset + i as u64, *v)?;
        }
        Ok(())
    }

    /// Copies `count` calldata elements starting at `cd_offset` into memory
    /// at `dst`, as `Field`-tagged cells. A calldata range that does not
    /// exist is an out-of-bounds access.
    pub fn calldata_copy(
        &mut self,
        calldata: &[U256],
        cd_offset: u64,
        count: u64,
        dst: u64,
    ) -> AvmResult<()> {
        let end = cd_offset.saturating_add(count);
        if end > calldata.len() as u64 {
            return Err(AvmError::MemoryOutOfBounds {
                offset: cd_offset,
                size: count,
            });
        }
        let values: Vec<_> = calldata[cd_offset as usize..end as usize]
            .iter()
            .map(|&v| TaggedValue::field(v))
            .collect();
        self.write_slice(dst, &values)
    }

    /// Resolves an indirect operand: the cell at `offset` must be `U32`
    /// tagged and holds the real offset.
    pub fn resolve_indirect(&self, offset: u64) -> AvmResult<u64> {
        Ok(self.read_tagged(offset, MemoryTag::U32)?.value.low_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tv(tag: MemoryTag, v: u64) -> TaggedValue {
        TaggedValue::new(tag, U256::from(v)).unwrap()
    }

    #[test]
    fn unset_cells_read_as_field_zero() {
        let mem = TaggedMemory::new();
        let cell = mem.read(1234).unwrap();
        assert_eq!(cell.tag, MemoryTag::Field);
        assert!(cell.value.is_zero());
    }

    #[test]
    fn tag_mismatch_is_rejected() {
        let a = tv(MemoryTag::U8, 1);
        let b = tv(MemoryTag::U16, 1);
        assert!(matches!(a.add(b), Err(AvmError::TagMismatch { .. })));
    }

    #[test]
    fn fixed_width_overflow_is_an_error() {
        let a = tv(MemoryTag::U8, 200);
        let b = tv(MemoryTag::U8, 100);
        assert!(matches!(a.add(b), Err(AvmError::Overflow { .. })));
        assert!(matches!(
            tv(MemoryTag::U8, 1).sub(tv(MemoryTag::U8, 2)),
            Err(AvmError::Overflow { .. })
        ));
        assert!(matches!(
            tv(MemoryTag::U64, u64::MAX).mul(tv(MemoryTag::U64, 2)),
            Err(AvmError::Overflow { .. })
        ));
    }

    #[test]
    fn field_arithmetic_wraps_modulo_the_field() {
        let modulus = field_modulus();
        let a = TaggedValue::field(modulus - 1);
        let b = TaggedValue::field(U256::from(2));
        assert_eq!(a.add(b).unwrap().value, U256::one());
        assert_eq!(
            TaggedValue::field(U256::zero()).sub(b).unwrap().value,
            modulus - 2
        );
    }

    #[test]
    fn bitwise_ops_reject_fields() {
        let f = TaggedValue::field(U256::from(3));
        assert!(matches!(f.and(f), Err(AvmError::TagMismatch { .. })));
        assert!(matches!(f.not(), Err(AvmError::TagMismatch { .. })));
    }

    #[test]
    fn shl_truncates_into_tag_width() {
        let a = tv(MemoryTag::U8, 0b1100_0001);
        let one = tv(MemoryTag::U8, 1);
        assert_eq!(a.shl(one).unwrap().value, U256::from(0b1000_0010u64));
    }

    #[test]
    fn division_by_zero_yields_zero() {
        let a = tv(MemoryTag::U64, 17);
        let zero = tv(MemoryTag::U64, 0);
        assert!(a.div(zero).unwrap().value.is_zero());
    }

    #[test]
    fn cast_truncates() {
        let a = tv(MemoryTag::U64, 0x1_0000_0001);
        assert_eq!(a.cast(MemoryTag::U32).value, U256::from(1));
        assert_eq!(a.cast(MemoryTag::U32).tag, MemoryTag::U32);
    }

    #[test]
    fn comparisons_yield_u1() {
        let a = tv(MemoryTag::U32, 3);
        let b = tv(MemoryTag::U32, 5);
        let lt = a.lt(b).unwrap();
        assert_eq!(lt.tag, MemoryTag::U1);
        assert_eq!(lt.value, U256::one());
        assert_eq!(a.eq_op(b).unwrap().value, U256::zero());
        assert_eq!(a.lte(a).unwrap().value, U256::one());
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut mem = TaggedMemory::new();
        assert!(matches!(
            mem.write(MEMORY_SIZE, TaggedValue::field(U256::one())),
            Err(AvmError::MemoryOutOfBounds { .. })
        ));
        assert!(matches!(
            mem.read(MEMORY_SIZE),
            Err(AvmError::MemoryOutOfBounds { .. })
        ));
    }

    #[test]
    fn calldata_copy_bounds_and_tags() {
        let mut mem = TaggedMemory::new();
        let calldata = [U256::from(10), U256::from(20), U256::from(30)];
        mem.calldata_copy(&calldata, 1, 2, 5).unwrap();
        assert_eq!(mem.read(5).unwrap().value, U256::from(20));
        assert_eq!(mem.read(6).unwrap().value, U256::from(30));
        assert_eq!(mem.read(5).unwrap().tag, MemoryTag::Field);

        assert!(matches!(
            mem.calldata_copy(&calldata, 2, 2, 0),
            Err(AvmError::MemoryOutOfBounds { .. })
        ));
    }

    #[test]
    fn indirect_resolution_requires_u32() {
        let mut mem = TaggedMemory::new();
        mem.write(0, tv(MemoryTag::U32, 7)).unwrap();
        assert_eq!(mem.resolve_indirect(0).unwrap(), 7);

        mem.write(1, TaggedValue::field(U256::from(7))).unwrap();
        assert!(matches!(
            mem.resolve_indirect(1),
            Err(AvmError::TagMismatch { .. })
        ));
    }
}
