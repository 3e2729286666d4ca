//! Distribution validation and merging.

use crate::error::Error;
use crate::proto::Distribution;
use crate::proto::distribution::BucketOption;

/// Checks structural validity: non-negative count, bucket counts
/// summing to the total, and a well-formed bucket layout.
pub fn validate_distribution(distribution: &Distribution) -> Result<(), Error> {
    if distribution.count < 0 {
        return Err(Error::InvalidDistribution(format!(
            "count {} is negative",
            distribution.count
        )));
    }
    if !distribution.bucket_counts.is_empty() {
        let bucket_total: i64 = distribution.bucket_counts.iter().sum();
        if bucket_total != distribution.count {
            return Err(Error::InvalidDistribution(format!(
                "bucket counts sum to {bucket_total}, expected {}",
                distribution.count
            )));
        }
    }
    match &distribution.bucket_option {
        Some(BucketOption::LinearBuckets(linear)) => {
            if linear.num_finite_buckets < 0 || linear.width <= 0.0 {
                return Err(Error::InvalidDistribution(
                    "linear buckets need a non-negative bucket count and positive width".into(),
                ));
            }
        }
        Some(BucketOption::ExponentialBuckets(exponential)) => {
            if exponential.num_finite_buckets < 0
                || exponential.growth_factor <= 1.0
                || exponential.scale <= 0.0
            {
                return Err(Error::InvalidDistribution(
                    "exponential buckets need growth factor > 1 and positive scale".into(),
                ));
            }
        }
        Some(BucketOption::ExplicitBuckets(explicit)) => {
            if explicit.bounds.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(Error::InvalidDistribution(
                    "explicit bucket bounds must be strictly increasing".into(),
                ));
            }
        }
        None => {}
    }
    Ok(())
}

/// Whether two distributions can be merged: identical bucket layout
/// and histogram length.
pub fn buckets_compatible(a: &Distribution, b: &Distribution) -> bool {
    a.bucket_option == b.bucket_option && a.bucket_counts.len() == b.bucket_counts.len()
}

/// Merges `from` into `to`, combining count, mean, extrema, squared
/// deviation and per-bucket counts. Fails when the bucket layouts
/// differ; the caller decides whether to drop or surface that.
pub fn merge_distribution(from: &Distribution, to: &mut Distribution) -> Result<(), Error> {
    if !buckets_compatible(from, to) {
        return Err(Error::IncompatibleDistributions);
    }
    if from.count == 0 {
        return Ok(());
    }
    if to.count == 0 {
        *to = from.clone();
        return Ok(());
    }

    let merged_count = to.count + from.count;
    let merged_mean =
        (to.mean * to.count as f64 + from.mean * from.count as f64) / merged_count as f64;
    // Parallel merge of squared deviations: each side contributes its
    // own deviation plus the shift of its mean to the merged mean.
    to.sum_of_squared_deviation += from.sum_of_squared_deviation
        + to.count as f64 * (to.mean - merged_mean).powi(2)
        + from.count as f64 * (from.mean - merged_mean).powi(2);
    to.minimum = to.minimum.min(from.minimum);
    to.maximum = to.maximum.max(from.maximum);
    to.mean = merged_mean;
    to.count = merged_count;
    for (into, add) in to.bucket_counts.iter_mut().zip(&from.bucket_counts) {
        *into += add;
    }
    Ok(())
}
