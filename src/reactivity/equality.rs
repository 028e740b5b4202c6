// ============================================================================
// spark-compose - Equality Functions
// Comparators for `write_if_changed_by` and `derived_with_equals`
// ============================================================================

/// Strict equality using PartialEq.
///
/// ```
/// use spark_compose::reactivity::equality::equals;
///
/// assert!(equals(&42, &42));
/// assert!(!equals(&"a", &"b"));
/// ```
pub fn equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// Float equality where NaN equals NaN.
///
/// Plain `==` would treat every NaN write as a change and every NaN derived
/// value as new.
///
/// ```
/// use spark_compose::reactivity::equality::nan_safe_equals;
///
/// assert!(nan_safe_equals(&f64::NAN, &f64::NAN));
/// assert!(nan_safe_equals(&1.5, &1.5));
/// assert!(!nan_safe_equals(&1.5, &f64::NAN));
/// ```
pub fn nan_safe_equals(a: &f64, b: &f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

/// Never equal: every comparison counts as a change.
pub fn never_equals<T>(_a: &T, _b: &T) -> bool {
    false
}

/// Always equal: no comparison counts as a change.
pub fn always_equals<T>(_a: &T, _b: &T) -> bool {
    true
}

/// Equality on list length only.
///
/// For list cells whose readers only care how many rows there are.
pub fn same_len<T>(a: &Vec<T>, b: &Vec<T>) -> bool {
    a.len() == b.len()
}

// =============================================================================
// TESTS
// =============================================================================
