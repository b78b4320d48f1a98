//! The type-parametric record layer.
//!
//! The queue core moves opaque fixed-width byte quanta; this trait is the
//! seam where a Rust type is bound to that quantum. An endpoint only becomes
//! valid when the descriptor's quantum equals `size_of::<T>()`.

/// Types that can travel through a queue as fixed-width records.
///
/// Records are copied into and out of the shared ring as raw bytes, and the
/// reader reinterprets whatever the writer produced.
///
/// # Safety
///
/// Implementers must ensure:
/// - The type has a stable in-memory layout (`#[repr(C)]`,
///   `#[repr(transparent)]`, or a primitive).
/// - Every bit pattern of `size_of::<T>()` bytes is a valid value, since the
///   peer's bytes are reinterpreted without inspection.
/// - The type contains no padding bytes and no pointers, references, or heap
///   handles; only the bytes themselves cross the process boundary.
pub unsafe trait Record: Copy + 'static {}

macro_rules! impl_record {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl Record for $t {}
        )*
    };
}

impl_record! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
}

unsafe impl<T: Record, const N: usize> Record for [T; N] {}
