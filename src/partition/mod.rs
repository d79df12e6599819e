// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

//! Exact integer partitioning for drift-free budget distribution.

#[cfg(test)]
mod tests;

/// Splits `total` into `parts` non-negative integers that sum exactly to
/// `total` and returns the part at position `index`.
///
/// Each part is either `total / parts` or `total / parts + 1`, with the
/// first `total % parts` positions receiving the larger value. The function
/// is pure and deterministic; fairness over time is obtained by rotating
/// `index` between invocations.
///
/// # Panics
///
/// Panics if `parts` is zero or `index` is not below `parts`.
#[must_use]
pub fn partitioned_integer_part(total: u64, parts: u64, index: u64) -> u64 {
    assert!(parts > 0, "cannot partition into zero parts");
    assert!(
        index < parts,
        "part index {index} out of range for {parts} parts"
    );
    let base = total / parts;
    if index < total % parts { base + 1 } else { base }
}
