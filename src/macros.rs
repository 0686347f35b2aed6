//! # Internal Macros
//!
//! Accessor generation for zerocopy structs whose fields use the
//! little-endian wrapper types (`U16`, `U32`, `U64`).
//!
//! ```ignore
//! impl PageDiskHeader {
//!     zerocopy_getters! {
//!         length: u32,
//!         map_id: u32,
//!         key_count: u16,
//!     }
//! }
//! ```
//!
//! Each listed field expands to a getter returning the native type. The
//! structs are built whole through constructors, so setters are not
//! generated.

/// Generates getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
