//! Uniform sampling over inclusive bounds.

use crate::codec::{LogValue, Scalar, TypeTag};
use crate::errors::FuzzError;
use rand::Rng;
use rand_chacha::ChaCha20Rng;

pub trait Sample: LogValue {
    /// Draws from `[lo, hi]`. Callers have already checked `lo < hi`.
    fn sample(rng: &mut ChaCha20Rng, lo: Self, hi: Self) -> Self;

    fn check_bounds(lo: Self, hi: Self) -> Result<(), FuzzError> {
        match lo.partial_cmp(&hi) {
            Some(std::cmp::Ordering::Greater) => Err(FuzzError::InvalidBounds(format!(
                "lower bound {lo:?} exceeds upper bound {hi:?}"
            ))),
            Some(_) => Ok(()),
            None => Err(FuzzError::InvalidBounds(format!(
                "unordered bounds {lo:?}..={hi:?}"
            ))),
        }
    }
}

macro_rules! sample_int {
    ($($ty:ty),*) => {
        $(
            impl Sample for $ty {
                fn sample(rng: &mut ChaCha20Rng, lo: Self, hi: Self) -> Self {
                    rng.gen_range(lo..=hi)
                }
            }
        )*
    };
}

sample_int!(i64, u64, i32, u32, i16, u16, i8, u8);

// `lo + (hi - lo) * u` overflows to infinity for wide ranges such as
// `MIN..=MAX`; interpolating keeps every intermediate finite.
macro_rules! sample_float {
    ($($ty:ty),*) => {
        $(
            impl Sample for $ty {
                fn sample(rng: &mut ChaCha20Rng, lo: Self, hi: Self) -> Self {
                    let u: $ty = rng.gen();
                    let value = lo * (1.0 - u) + hi * u;
                    value.clamp(lo, hi)
                }
            }
        )*
    };
}

sample_float!(f64, f32);

impl Sample for bool {
    fn sample(rng: &mut ChaCha20Rng, _lo: Self, _hi: Self) -> Self {
        rng.gen()
    }
}

/// Full representable range of a tag, lowest to highest.
pub fn full_range(tag: TypeTag) -> (Scalar, Scalar) {
    match tag {
        TypeTag::I64 => (Scalar::I64(i64::MIN), Scalar::I64(i64::MAX)),
        TypeTag::U64 => (Scalar::U64(u64::MIN), Scalar::U64(u64::MAX)),
        TypeTag::F64 => (Scalar::F64(f64::MIN), Scalar::F64(f64::MAX)),
        TypeTag::I32 => (Scalar::I32(i32::MIN), Scalar::I32(i32::MAX)),
        TypeTag::U32 => (Scalar::U32(u32::MIN), Scalar::U32(u32::MAX)),
        TypeTag::I16 => (Scalar::I16(i16::MIN), Scalar::I16(i16::MAX)),
        TypeTag::U16 => (Scalar::U16(u16::MIN), Scalar::U16(u16::MAX)),
        TypeTag::I8 => (Scalar::I8(i8::MIN), Scalar::I8(i8::MAX)),
        TypeTag::U8 => (Scalar::U8(u8::MIN), Scalar::U8(u8::MAX)),
        TypeTag::F32 => (Scalar::F32(f32::MIN), Scalar::F32(f32::MAX)),
        TypeTag::Bool => (Scalar::Bool(false), Scalar::Bool(true)),
    }
}

#[cfg(test)]
mod tests {
    use super::{full_range, Sample};
    use crate::codec::{Scalar, TypeTag};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn integer_samples_stay_inclusive() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut seen = [false; 3];
        for _ in 0..200 {
            let v = i32::sample(&mut rng, -1, 1);
            assert!((-1..=1).contains(&v));
            seen[(v + 1) as usize] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn float_full_range_never_overflows() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        for _ in 0..1000 {
            let v = f64::sample(&mut rng, f64::MIN, f64::MAX);
            assert!(v.is_finite());
            let w = f32::sample(&mut rng, f32::MIN, f32::MAX);
            assert!(w.is_finite());
        }
    }

    #[test]
    fn bounds_are_checked() {
        assert!(u8::check_bounds(3, 2).is_err());
        assert!(u8::check_bounds(2, 2).is_ok());
        assert!(f64::check_bounds(f64::NAN, 1.0).is_err());
        assert!(bool::check_bounds(true, false).is_err());
    }

    #[test]
    fn full_range_matches_tag() {
        for tag in TypeTag::ALL {
            let (lo, hi) = full_range(tag);
            assert_eq!(lo.tag(), tag);
            assert_eq!(hi.tag(), tag);
        }
        assert_eq!(full_range(TypeTag::I8), (Scalar::I8(-128), Scalar::I8(127)));
    }
}
