//! PCA reducer
//!
//! Keeps the leading principal components that explain at least the requested
//! share of variance. Eigenvectors of the covariance matrix come from cyclic
//! Jacobi rotations, which is exact enough for the small feature count here.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaReducer {
    pub mean: Vec<f64>,
    /// One row per kept component, each of input width
    pub components: Vec<Vec<f64>>,
    pub explained_variance_ratio: Vec<f64>,
}

impl PcaReducer {
    /// Fit on `rows` keeping enough components for `variance_target` (0..1]
    pub fn fit(rows: &[Vec<f64>], variance_target: f64) -> Option<Self> {
        let n = rows.len();
        let d = rows.first()?.len();
        if n < 2 || d == 0 {
            return None;
        }

        let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let data = Array2::from_shape_vec((n, d), flat).ok()?;
        let mean: Array1<f64> = data.mean_axis(Axis(0))?;
        let centered = &data - &mean;
        let cov = centered.t().dot(&centered) / (n as f64 - 1.0);

        let (eigenvalues, eigenvectors) = symmetric_eigen(&cov);
        let total: f64 = eigenvalues.iter().map(|v| v.max(0.0)).sum();

        let mut k = 0;
        let mut cumulative = 0.0;
        let mut ratios = Vec::new();
        for value in &eigenvalues {
            let ratio = if total > 1e-12 { value.max(0.0) / total } else { 0.0 };
            ratios.push(ratio);
            cumulative += ratio;
            k += 1;
            if cumulative >= variance_target || total <= 1e-12 {
                break;
            }
        }

        let components = (0..k)
            .map(|c| eigenvectors.column(c).to_vec())
            .collect();

        Some(Self {
            mean: mean.to_vec(),
            components,
            explained_variance_ratio: ratios,
        })
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        self.components
            .iter()
            .map(|comp| {
                comp.iter()
                    .zip(row.iter().zip(self.mean.iter()))
                    .map(|(w, (x, m))| w * (x - m))
                    .sum()
            })
            .collect()
    }

    pub fn input_dim(&self) -> usize {
        self.mean.len()
    }

    pub fn output_dim(&self) -> usize {
        self.components.len()
    }
}

/// Eigen-decomposition of a symmetric matrix. Eigenvalues descending,
/// eigenvectors as columns, each signed so its largest entry is positive.
fn symmetric_eigen(matrix: &Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = matrix.nrows();
    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(n);

    for _sweep in 0..100 {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[[i, j]].powi(2))
            .sum();
        if off < 1e-18 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| a[[y, y]].total_cmp(&a[[x, x]]));

    let eigenvalues = order.iter().map(|&i| a[[i, i]]).collect();
    let mut vectors = Array2::<f64>::zeros((n, n));
    for (col, &i) in order.iter().enumerate() {
        let mut vec = v.column(i).to_owned();
        let pivot = vec
            .iter()
            .copied()
            .max_by(|x, y| x.abs().total_cmp(&y.abs()))
            .unwrap_or(1.0);
        if pivot < 0.0 {
            vec.mapv_inplace(|x| -x);
        }
        vectors.column_mut(col).assign(&vec);
    }

    (eigenvalues, vectors)
}
