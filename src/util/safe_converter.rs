/// Widening casts that can never lose information
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// Narrowing casts that clamp to the target type's maximum instead of wrapping around
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<u32> for u64 {
    fn saturating_cast(self) -> u32 {
        u32::try_from(self).unwrap_or(u32::MAX)
    }
}
impl SaturatingCast<u64> for u128 {
    fn saturating_cast(self) -> u64 {
        u64::try_from(self).unwrap_or(u64::MAX)
    }
}
