// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

use super::partitioned_integer_part;

#[test]
fn parts_sum_exactly_to_the_total() {
    for total in 0..=128 {
        for parts in 1..=16 {
            let sum: u64 = (0..parts)
                .map(|index| partitioned_integer_part(total, parts, index))
                .sum();
            assert_eq!(total, sum, "total={total} parts={parts}");
        }
    }
}

#[test]
fn each_part_is_floor_or_ceil_of_the_even_share() {
    for total in 0u64..=128 {
        for parts in 1u64..=16 {
            let floor = total / parts;
            let ceil = total.div_ceil(parts);
            for index in 0..parts {
                let part = partitioned_integer_part(total, parts, index);
                assert!(
                    part == floor || part == ceil,
                    "total={total} parts={parts} index={index} part={part}"
                );
            }
        }
    }
}

#[test]
fn the_remainder_goes_to_the_first_positions() {
    // 7 = 3 + 2 + 2
    assert_eq!(3, partitioned_integer_part(7, 3, 0));
    assert_eq!(2, partitioned_integer_part(7, 3, 1));
    assert_eq!(2, partitioned_integer_part(7, 3, 2));
    // 100 split 10 ways is even
    for index in 0..10 {
        assert_eq!(10, partitioned_integer_part(100, 10, index));
    }
}

#[test]
fn zero_total_yields_zero_parts() {
    for index in 0..5 {
        assert_eq!(0, partitioned_integer_part(0, 5, index));
    }
}

#[test]
fn large_totals_do_not_overflow() {
    let total = u64::MAX - 1;
    let sum: u64 = (0..7)
        .map(|index| partitioned_integer_part(total, 7, index))
        .sum();
    assert_eq!(total, sum);
}

#[test]
#[should_panic(expected = "cannot partition into zero parts")]
fn zero_parts_is_a_programmer_error() {
    let _ = partitioned_integer_part(1, 0, 0);
}

#[test]
#[should_panic(expected = "out of range")]
fn out_of_range_index_is_a_programmer_error() {
    let _ = partitioned_integer_part(1, 3, 3);
}
