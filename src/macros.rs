//! # Internal Macros
//!
//! ## le_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U16, U32, U64). Used by the object header that
//! lives directly inside the shared heap, where fields are unaligned.
//!
//! ```ignore
//! #[repr(C)]
//! struct ObjectHeader {
//!     id: U64,
//!     type_id: U32,
//! }
//!
//! impl ObjectHeader {
//!     le_accessors! {
//!         id: u64,
//!         type_id: u32,
//!     }
//! }
//!
//! // Generates id(), set_id(), type_id(), set_type_id()
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! le_accessors {
    (@impl $field:ident, u16) => {
        $crate::le_accessors!(@emit $field, u16, U16);
    };
    (@impl $field:ident, u32) => {
        $crate::le_accessors!(@emit $field, u32, U32);
    };
    (@impl $field:ident, u64) => {
        $crate::le_accessors!(@emit $field, u64, U64);
    };
    (@emit $field:ident, $native:ty, $wrapper:ident) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> $native {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: $native) {
                self.$field = ::zerocopy::little_endian::$wrapper::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::le_accessors!(@impl $field, $ty);
        )*
    };
}
