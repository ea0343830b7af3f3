//! The prime cascade used to size bucket arrays.
//!
//! Bucket counts are always chosen from this fixed table, or as a product of
//! its entries, rather than as arbitrary powers of two. This keeps the
//! modulo-based bucket distribution independent of the quality of the hash
//! function's low bits.

/// Base primes, ascending. The smallest is the size of a freshly cleared
/// table (see `ConcurrentMap::clear_and_shrink`); the largest is the factor
/// repeatedly divided out for very large requested capacities.
pub const PRIME_CASCADE: [usize; 16] = [
    11, 17, 29, 47, 79, 127, 211, 337, 547, 887, 1433, 2311, 3739, 6053, 9791, 15859,
];

/// The smallest bucket count a freshly cleared-and-shrunk table uses.
pub const SMALLEST_PRIME: usize = PRIME_CASCADE[0];

/// Picks a bucket count `>= min_keys`, as either a single prime from the
/// cascade or a product of its entries.
///
/// Large requested sizes are built up by repeatedly factoring out the
/// largest prime in the cascade (so a single table is never asked to hold an
/// astronomically long chain in the smallest bucket), then topped off with
/// the smallest prime that covers what remains.
pub fn pick_prime_product(min_keys: usize) -> usize {
    let largest = *PRIME_CASCADE.last().unwrap();
    let mut product: usize = 1;
    let mut remaining = min_keys.max(1);

    while remaining > largest {
        remaining = div_ceil(remaining, largest);
        product = product.saturating_mul(largest);
    }

    let idx = PRIME_CASCADE.partition_point(|&p| p < remaining);
    let smallest = PRIME_CASCADE.get(idx).copied().unwrap_or(largest);
    product.saturating_mul(smallest)
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_below_requested() {
        for m in [0usize, 1, 10, 11, 12, 1000, 100_000, 10_000_000] {
            let p = pick_prime_product(m);
            assert!(p >= m, "pick_prime_product({m}) = {p} is too small");
        }
    }

    #[test]
    fn small_requests_hit_the_table_directly() {
        assert_eq!(pick_prime_product(1), SMALLEST_PRIME);
        assert_eq!(pick_prime_product(11), 11);
        assert_eq!(pick_prime_product(12), 17);
        assert_eq!(pick_prime_product(15859), 15859);
    }

    #[test]
    fn large_requests_factor_out_the_largest_prime() {
        let p = pick_prime_product(100_000);
        assert!(p >= 100_000);
        // should be expressible as (a product of 15859s) * (a single cascade prime)
        let mut rest = p;
        let mut factors = 0;
        while rest % 15859 == 0 && rest > 15859 {
            rest /= 15859;
            factors += 1;
        }
        assert!(PRIME_CASCADE.contains(&rest) || rest == 15859);
        let _ = factors;
    }
}
