//! Tagged Values - What a Reference Slot Holds
//!
//! Every slot in a heap object is one 64-bit word. The encoding decides
//! whether the word is a heap reference, which is the only question the
//! write barrier asks at run time.
//!
//! ```text
//! 64-bit Slot Layout:
//! ┌──────────────────┬────────────────────────────────────────┐
//! │  Tag (63-48)     │             Payload (47-0)              │
//! └──────────────────┴────────────────────────────────────────┘
//!
//! 0x0000 | address, bit1 = 0   heap object (bit0 = weak)
//! 0x0000 | small, bit1 = 1     special (null, undefined, booleans)
//! 0x0001 .. 0xFFFE             double, offset by 1 << 48
//! 0xFFFF | i32                 integer
//! ```

/// Integer tag (high 16 bits all ones)
pub const TAG_INT: u64 = 0xFFFF_0000_0000_0000;
/// Mask covering every non-address tag bit
pub const TAG_HIGH_MASK: u64 = 0xFFFF_0000_0000_0000;
/// Special-value tag bit
pub const TAG_SPECIAL: u64 = 0x02;
/// Weak-reference tag bit
pub const TAG_WEAK: u64 = 0x01;
/// Bits that must be clear for a heap object
pub const TAG_HEAP_OBJECT_MASK: u64 = TAG_HIGH_MASK | TAG_SPECIAL;
/// Offset applied to doubles so that they never collide with pointers
pub const DOUBLE_ENCODE_OFFSET: u64 = 1 << 48;

const VALUE_HOLE: u64 = 0x00;
const VALUE_NULL: u64 = TAG_SPECIAL;
const VALUE_FALSE: u64 = 0x04 | TAG_SPECIAL;
const VALUE_TRUE: u64 = 0x05 | TAG_SPECIAL;
const VALUE_UNDEFINED: u64 = 0x08 | TAG_SPECIAL;

/// A raw slot value
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TaggedValue(u64);

impl TaggedValue {
    pub const HOLE: TaggedValue = TaggedValue(VALUE_HOLE);
    pub const NULL: TaggedValue = TaggedValue(VALUE_NULL);
    pub const UNDEFINED: TaggedValue = TaggedValue(VALUE_UNDEFINED);
    pub const TRUE: TaggedValue = TaggedValue(VALUE_TRUE);
    pub const FALSE: TaggedValue = TaggedValue(VALUE_FALSE);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        TaggedValue(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Strong reference to the object at `address`
    ///
    /// `address` must be slot aligned and below 2^48.
    #[inline]
    pub fn from_object(address: usize) -> Self {
        debug_assert_eq!(address as u64 & TAG_HIGH_MASK, 0, "address above 48 bits");
        debug_assert_eq!(address % crate::heap::SLOT_SIZE, 0, "unaligned object address");
        TaggedValue(address as u64)
    }

    /// Weak reference to the object at `address`
    #[inline]
    pub fn weak_object(address: usize) -> Self {
        TaggedValue(Self::from_object(address).0 | TAG_WEAK)
    }

    #[inline]
    pub const fn from_int(value: i32) -> Self {
        TaggedValue(TAG_INT | (value as u32 as u64))
    }

    #[inline]
    pub fn from_double(value: f64) -> Self {
        TaggedValue(value.to_bits().wrapping_add(DOUBLE_ENCODE_OFFSET))
    }

    #[inline]
    pub const fn from_bool(value: bool) -> Self {
        if value {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// The run-time heap-object test used by `UnknownBarrier` stores
    ///
    /// One mask and one compare; the hole value is excluded.
    #[inline(always)]
    pub const fn is_heap_object(self) -> bool {
        (self.0 & TAG_HEAP_OBJECT_MASK) == 0 && self.0 != VALUE_HOLE
    }

    #[inline]
    pub const fn is_weak(self) -> bool {
        self.is_heap_object() && (self.0 & TAG_WEAK) != 0
    }

    #[inline]
    pub const fn is_int(self) -> bool {
        (self.0 & TAG_HIGH_MASK) == TAG_INT
    }

    #[inline]
    pub const fn is_double(self) -> bool {
        let tag = self.0 & TAG_HIGH_MASK;
        tag != 0 && tag != TAG_INT
    }

    #[inline]
    pub const fn is_special(self) -> bool {
        (self.0 & TAG_HIGH_MASK) == 0 && (self.0 & TAG_SPECIAL) != 0
    }

    /// Address of the referenced object with the weak tag stripped
    #[inline]
    pub fn heap_address(self) -> Option<usize> {
        if self.is_heap_object() {
            Some((self.0 & !TAG_WEAK) as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_int(self) -> Option<i32> {
        if self.is_int() {
            Some(self.0 as u32 as i32)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_double(self) -> Option<f64> {
        if self.is_double() {
            Some(f64::from_bits(self.0.wrapping_sub(DOUBLE_ENCODE_OFFSET)))
        } else {
            None
        }
    }
}

impl std::fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::HOLE => write!(f, "Hole"),
            Self::NULL => write!(f, "Null"),
            Self::UNDEFINED => write!(f, "Undefined"),
            Self::TRUE => write!(f, "True"),
            Self::FALSE => write!(f, "False"),
            v if v.is_weak() => write!(f, "Weak({:#x})", v.0 & !TAG_WEAK),
            v if v.is_heap_object() => write!(f, "Object({:#x})", v.0),
            v if v.is_int() => write!(f, "Int({})", v.0 as u32 as i32),
            v => match v.as_double() {
                Some(d) => write!(f, "Double({})", d),
                None => write!(f, "Raw({:#x})", v.0),
            },
        }
    }
}
