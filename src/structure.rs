//! Useful macros for parsing SD card register structures.
//!
//! SD registers are transmitted most-significant byte first, so byte 0 of
//! `data` holds the top bits of the register and whole-byte fields are
//! big-endian.

/// Pull `$num_bits` bits out of byte `$offset`, starting at bit `$start`
/// (0 is the least significant bit).
macro_rules! access_field {
    ($self:expr, $offset:expr, $start_bit:expr, 1) => {
        ($self.data[$offset] & (1 << $start_bit)) != 0
    };
    ($self:expr, $offset:expr, $start:expr, $num_bits:expr) => {
        ($self.data[$offset] >> $start) & (((1u16 << $num_bits) - 1) as u8)
    };
}

/// Define a getter for a register field.
///
/// A field is either a single bit, a run of bits inside one byte, a list of
/// `(offset, start_bit, num_bits)` parts joined most-significant part first,
/// or a whole big-endian `u8`/`u16`/`u32` starting at an offset.
macro_rules! define_field {
    ($name:ident, bool, $offset:expr, $bit:expr) => {
        #[doc = concat!("The `", stringify!($name), "` field of the register.")]
        pub fn $name(&self) -> bool {
            access_field!(self, $offset, $bit, 1)
        }
    };
    ($name:ident, u8, $offset:expr, $start_bit:expr, $num_bits:expr) => {
        #[doc = concat!("The `", stringify!($name), "` field of the register.")]
        pub fn $name(&self) -> u8 {
            access_field!(self, $offset, $start_bit, $num_bits)
        }
    };
    ($name:ident, $type:ty, [ $( ( $offset:expr, $start_bit:expr, $num_bits:expr ) ),+ ]) => {
        #[doc = concat!("The `", stringify!($name), "` field of the register.")]
        pub fn $name(&self) -> $type {
            let mut result = 0;
            $(
                result <<= $num_bits;
                result |= access_field!(self, $offset, $start_bit, $num_bits) as $type;
            )+
            result
        }
    };

    ($name:ident, u8, $offset:expr) => {
        #[doc = concat!("The `", stringify!($name), "` field of the register.")]
        pub fn $name(&self) -> u8 {
            self.data[$offset]
        }
    };

    ($name:ident, u16, $offset:expr) => {
        #[doc = concat!("The `", stringify!($name), "` field of the register.")]
        pub fn $name(&self) -> u16 {
            BigEndian::read_u16(&self.data[$offset..$offset + 2])
        }
    };

    ($name:ident, u32, $offset:expr) => {
        #[doc = concat!("The `", stringify!($name), "` field of the register.")]
        pub fn $name(&self) -> u32 {
            BigEndian::read_u32(&self.data[$offset..$offset + 4])
        }
    };
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
