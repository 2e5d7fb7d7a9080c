//! Pure aggregation functions used by [`crate::timestamp_store::TimestampStore::range_decimated`].
//!
//! Each value chunker treats a sample as a vector of `f64` fields so a
//! single scalar and a packed tuple share the same code path (index-wise
//! min/max/mean/median). Grounded on `original_source/db/chunker.py`.

use chrono::{DateTime, Utc};

pub type TimestampChunker = fn(&[DateTime<Utc>]) -> Vec<DateTime<Utc>>;
pub type ValueChunker = fn(&[Vec<f64>]) -> Vec<Vec<f64>>;

pub fn non_chunker_ts(x: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    x.to_vec()
}

pub fn non_chunker_val(x: &[Vec<f64>]) -> Vec<Vec<f64>> {
    x.to_vec()
}

pub fn left(x: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    vec![x[0]]
}

pub fn right(x: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    vec![*x.last().expect("window is never empty")]
}

pub fn center(x: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    if x.len() > 1 {
        let first = x[0];
        let last = *x.last().unwrap();
        vec![first + (last - first) / 2]
    } else {
        vec![x[0]]
    }
}

pub fn min(x: &[Vec<f64>]) -> Vec<Vec<f64>> {
    vec![elementwise(x, |a, b| a.min(b))]
}

pub fn max(x: &[Vec<f64>]) -> Vec<Vec<f64>> {
    vec![elementwise(x, |a, b| a.max(b))]
}

pub fn mean(x: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let width = x[0].len();
    let mut sums = vec![0.0; width];
    for row in x {
        for (i, v) in row.iter().enumerate() {
            sums[i] += v;
        }
    }
    let n = x.len() as f64;
    vec![sums.into_iter().map(|s| s / n).collect()]
}

pub fn median(x: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let width = x[0].len();
    let mut out = vec![0.0; width];
    for i in 0..width {
        let mut column: Vec<f64> = x.iter().map(|row| row[i]).collect();
        column.sort_by(|a, b| a.partial_cmp(b).expect("NaN in chunked data"));
        let mid = column.len() / 2;
        out[i] = if column.len() % 2 == 0 {
            (column[mid - 1] + column[mid]) / 2.0
        } else {
            column[mid]
        };
    }
    vec![out]
}

/// The 3-output chunker: (min, mean, max), each index-wise. A 1-sample
/// window triplicates its single point rather than reducing it.
pub fn minmeanmax(x: &[Vec<f64>]) -> Vec<Vec<f64>> {
    if x.len() > 1 {
        vec![min(x).remove(0), mean(x).remove(0), max(x).remove(0)]
    } else {
        vec![x[0].clone(), x[0].clone(), x[0].clone()]
    }
}

/// Timestamp companion to [`minmeanmax`]: (first, center, last).
pub fn timestamp_minmeanmax(x: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    if x.len() > 1 {
        vec![left(x)[0], center(x)[0], right(x)[0]]
    } else {
        vec![x[0], x[0], x[0]]
    }
}

fn elementwise(x: &[Vec<f64>], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    let width = x[0].len();
    let mut out = x[0].clone();
    for row in &x[1..] {
        for i in 0..width {
            out[i] = f(out[i], row[i]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(s, 0).unwrap()
    }

    #[test]
    fn center_is_midpoint() {
        let ts = vec![t(0), t(10)];
        assert_eq!(center(&ts), vec![t(5)]);
    }

    #[test]
    fn center_of_one_is_itself() {
        assert_eq!(center(&[t(3)]), vec![t(3)]);
    }

    #[test]
    fn mean_is_elementwise() {
        let vals = vec![vec![1.0, 10.0], vec![3.0, 20.0]];
        assert_eq!(mean(&vals), vec![vec![2.0, 15.0]]);
    }

    #[test]
    fn median_of_three() {
        let vals = vec![vec![1.0], vec![5.0], vec![3.0]];
        assert_eq!(median(&vals), vec![vec![3.0]]);
    }

    #[test]
    fn minmeanmax_triplicates_single_sample() {
        let vals = vec![vec![7.0]];
        assert_eq!(minmeanmax(&vals), vec![vec![7.0], vec![7.0], vec![7.0]]);
    }

    #[test]
    fn minmeanmax_reduces_multi_sample_window() {
        let vals = vec![vec![1.0], vec![2.0], vec![9.0]];
        assert_eq!(minmeanmax(&vals), vec![vec![1.0], vec![4.0], vec![9.0]]);
    }
}
