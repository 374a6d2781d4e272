use core::fmt::Debug;

use num_traits::NumCast;

/// Runtime tag for the element type of a local shard.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum DType {
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 8-bit unsigned integer.
    U8,
    /// 32-bit unsigned integer.
    U32,
}

/// Element types that can be held by a [`DistributedTensor`](crate::DistributedTensor)
/// and moved through a [`Collective`](crate::comm::Collective).
pub trait Element: NumCast + Copy + Debug + PartialEq + Send + Sync + 'static {
    /// The runtime tag of this element type.
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;
            }
        )*
    };
}

impl_element!(
    f32 => F32,
    f64 => F64,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
);
