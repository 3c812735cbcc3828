/// Absolute-tolerance closeness assert with a readable failure message.
pub fn assert_close(x: f64, y: f64, tolerance: f64) {
    assert!(
        (x - y).abs() <= tolerance,
        "{x} and {y} differ by {} (tolerance {tolerance})",
        (x - y).abs()
    );
}
