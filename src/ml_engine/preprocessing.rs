//! Median imputation and standardization
//!
//! Both are fit once per training run and stored inside the model bundle so
//! live predictions go through exactly the same transforms.

use serde::{Deserialize, Serialize};

/// Replaces non-finite values with the per-feature training median
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedianImputer {
    pub medians: Vec<f64>,
}

impl MedianImputer {
    pub fn fit(rows: &[Vec<f64>], n_features: usize) -> Self {
        let medians = (0..n_features)
            .map(|j| {
                let mut col: Vec<f64> = rows
                    .iter()
                    .filter_map(|r| r.get(j).copied())
                    .filter(|v| v.is_finite())
                    .collect();
                // A column with no observed value has nothing to impute from
                median(&mut col).unwrap_or(0.0)
            })
            .collect();
        Self { medians }
    }

    pub fn transform_row(&self, row: &mut [f64]) {
        for (v, m) in row.iter_mut().zip(self.medians.iter()) {
            if !v.is_finite() {
                *v = *m;
            }
        }
    }

    pub fn n_features(&self) -> usize {
        self.medians.len()
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Zero-mean, unit-variance scaling. Constant features get scale 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>], n_features: usize) -> Self {
        let n = rows.len().max(1) as f64;
        let mut means = vec![0.0; n_features];
        for row in rows {
            for (m, v) in means.iter_mut().zip(row.iter()) {
                *m += v;
            }
        }
        means.iter_mut().for_each(|m| *m /= n);

        let mut scales = vec![0.0; n_features];
        for row in rows {
            for ((s, v), m) in scales.iter_mut().zip(row.iter()).zip(means.iter()) {
                *s += (v - m).powi(2);
            }
        }
        for s in scales.iter_mut() {
            let std = (*s / n).sqrt();
            *s = if std > 1e-12 { std } else { 1.0 };
        }

        Self { means, scales }
    }

    pub fn transform_row(&self, row: &mut [f64]) {
        for ((v, m), s) in row.iter_mut().zip(self.means.iter()).zip(self.scales.iter()) {
            *v = (*v - m) / s;
        }
    }

    pub fn n_features(&self) -> usize {
        self.means.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imputer_uses_median_not_zero() {
        let rows = vec![
            vec![1.0, 10.0],
            vec![3.0, f64::NAN],
            vec![100.0, 30.0],
        ];
        let imputer = MedianImputer::fit(&rows, 2);
        assert_eq!(imputer.medians, vec![3.0, 20.0]);

        let mut row = vec![f64::NAN, f64::INFINITY];
        imputer.transform_row(&mut row);
        assert_eq!(row, vec![3.0, 20.0]);
    }

    #[test]
    fn test_scaler_zero_mean_unit_variance() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0], vec![5.0, 5.0]];
        let scaler = StandardScaler::fit(&rows, 2);
        assert!((scaler.means[0] - 3.0).abs() < 1e-12);
        assert_eq!(scaler.scales[1], 1.0);

        let mut row = vec![3.0, 5.0];
        scaler.transform_row(&mut row);
        assert!(row[0].abs() < 1e-12);
        assert!(row[1].abs() < 1e-12);
    }
}
