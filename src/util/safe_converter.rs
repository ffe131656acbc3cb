/// Widening casts that can not lose information on any supported platform
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// For narrowing casts where the caller checked the value range before.
/// NB: The implementations panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: the caller should have ensured the value range")
    }
}

impl PrecheckedCast<i32> for usize {
    fn prechecked_cast(self) -> i32 {
        self.try_into().expect("this is a bug: the caller should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_casts() {
        let len: usize = u32::MAX.safe_cast();
        assert_eq!(len, 4_294_967_295);

        let narrowed: u32 = 17usize.prechecked_cast();
        assert_eq!(narrowed, 17);
        let narrowed: i32 = (i32::MAX as usize).prechecked_cast();
        assert_eq!(narrowed, i32::MAX);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: i32 = (i32::MAX as usize + 1).prechecked_cast();
    }
}
