/// The remainder of `a / b`, with the sign of `b`.
pub fn modulus<T: num_traits::Float>(a: T, b: T) -> T {
    let r = a % b;
    if r / b < T::zero() { r + b } else { r }
}

/// Rounds up to a multiple of `align`, which must be a power of two.
pub fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[test]
fn test_modulus() {
    assert_eq!(modulus(7.0, 3.0), 1.0);
    assert_eq!(modulus(-1.0, 3.0), 2.0);
    assert_eq!(modulus(-6.0, 3.0), 0.0);
    assert_eq!(modulus(1.0, -3.0), -2.0);
    assert_eq!(modulus(-7.5f32, 360.0), 352.5);
    assert!(modulus(1.0f64, 0.0).is_nan());
    assert!(modulus(f64::INFINITY, 2.0).is_nan());
}

#[test]
fn test_align_up() {
    assert_eq!(align_up(0, 8), 0);
    assert_eq!(align_up(1, 8), 8);
    assert_eq!(align_up(8, 8), 8);
    assert_eq!(align_up(61, 16), 64);
}
