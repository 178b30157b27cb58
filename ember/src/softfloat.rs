//! Float and double arithmetic over raw bit patterns.
//!
//! The engine never assumes hardware float registers: values travel
//! the stack as tagged words and arithmetic goes through these
//! helpers, which take and return IEEE-754 bit patterns.

#[inline]
fn f(bits: u32) -> f32 {
    f32::from_bits(bits)
}

#[inline]
fn d(bits: u64) -> f64 {
    f64::from_bits(bits)
}

pub fn float_add(a: u32, b: u32) -> u32 {
    (f(a) + f(b)).to_bits()
}

pub fn float_sub(a: u32, b: u32) -> u32 {
    (f(a) - f(b)).to_bits()
}

pub fn float_mul(a: u32, b: u32) -> u32 {
    (f(a) * f(b)).to_bits()
}

pub fn float_div(a: u32, b: u32) -> u32 {
    (f(a) / f(b)).to_bits()
}

pub fn float_rem(a: u32, b: u32) -> u32 {
    (f(a) % f(b)).to_bits()
}

pub fn float_neg(a: u32) -> u32 {
    (-f(a)).to_bits()
}

/// Three-way compare; NaN collapses to `nan_result` (-1 for cmpl,
/// +1 for cmpg).
pub fn float_cmp(a: u32, b: u32, nan_result: i32) -> i32 {
    match f(a).partial_cmp(&f(b)) {
        Some(core::cmp::Ordering::Less) => -1,
        Some(core::cmp::Ordering::Equal) => 0,
        Some(core::cmp::Ordering::Greater) => 1,
        None => nan_result,
    }
}

pub fn double_add(a: u64, b: u64) -> u64 {
    (d(a) + d(b)).to_bits()
}

pub fn double_sub(a: u64, b: u64) -> u64 {
    (d(a) - d(b)).to_bits()
}

pub fn double_mul(a: u64, b: u64) -> u64 {
    (d(a) * d(b)).to_bits()
}

pub fn double_div(a: u64, b: u64) -> u64 {
    (d(a) / d(b)).to_bits()
}

pub fn double_rem(a: u64, b: u64) -> u64 {
    (d(a) % d(b)).to_bits()
}

pub fn double_neg(a: u64) -> u64 {
    (-d(a)).to_bits()
}

pub fn double_cmp(a: u64, b: u64, nan_result: i32) -> i32 {
    match d(a).partial_cmp(&d(b)) {
        Some(core::cmp::Ordering::Less) => -1,
        Some(core::cmp::Ordering::Equal) => 0,
        Some(core::cmp::Ordering::Greater) => 1,
        None => nan_result,
    }
}

// conversions; narrowing saturates the way managed code expects

pub fn int_to_float(v: i32) -> u32 {
    (v as f32).to_bits()
}

pub fn float_to_int(bits: u32) -> i32 {
    let v = f(bits);
    if v.is_nan() { 0 } else { v as i32 }
}

pub fn int_to_double(v: i32) -> u64 {
    (v as f64).to_bits()
}

pub fn double_to_int(bits: u64) -> i32 {
    let v = d(bits);
    if v.is_nan() { 0 } else { v as i32 }
}

pub fn long_to_float(v: i64) -> u32 {
    (v as f32).to_bits()
}

pub fn float_to_long(bits: u32) -> i64 {
    let v = f(bits);
    if v.is_nan() { 0 } else { v as i64 }
}

pub fn long_to_double(v: i64) -> u64 {
    (v as f64).to_bits()
}

pub fn double_to_long(bits: u64) -> i64 {
    let v = d(bits);
    if v.is_nan() { 0 } else { v as i64 }
}

pub fn float_to_double(bits: u32) -> u64 {
    (f(bits) as f64).to_bits()
}

pub fn double_to_float(bits: u64) -> u32 {
    (d(bits) as f32).to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_float_arithmetic() {
        let a = 1.5f32.to_bits();
        let b = 2.25f32.to_bits();
        assert_eq!(f32::from_bits(float_add(a, b)), 3.75);
        assert_eq!(f32::from_bits(float_mul(a, b)), 3.375);
    }

    #[test]
    fn division_by_zero_is_infinity_not_a_trap() {
        let one = 1.0f32.to_bits();
        let zero = 0.0f32.to_bits();
        assert!(f32::from_bits(float_div(one, zero)).is_infinite());
        assert!(f64::from_bits(double_div(1.0f64.to_bits(), 0.0f64.to_bits())).is_infinite());
    }

    #[test]
    fn nan_compare_uses_the_requested_collapse() {
        let nan = f32::NAN.to_bits();
        let one = 1.0f32.to_bits();
        assert_eq!(float_cmp(nan, one, -1), -1);
        assert_eq!(float_cmp(nan, one, 1), 1);
        assert_eq!(float_cmp(one, one, -1), 0);
    }

    #[test]
    fn nan_narrowing_is_zero() {
        assert_eq!(float_to_int(f32::NAN.to_bits()), 0);
        assert_eq!(double_to_long(f64::NAN.to_bits()), 0);
    }

    #[test]
    fn conversion_roundtrips() {
        assert_eq!(float_to_int(int_to_float(-7)), -7);
        assert_eq!(double_to_long(long_to_double(1 << 40)), 1 << 40);
        assert_eq!(
            f64::from_bits(float_to_double(0.5f32.to_bits())),
            0.5f64
        );
    }
}
