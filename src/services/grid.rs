//! Iteration × time numeric container used by the decline models.
//!
//! Rows are iterations, columns are points of the shared time axis. Masked
//! points are stored as `NaN`.

#[derive(Debug, Clone, PartialEq)]
pub struct IterationGrid {
    steps: usize,
    values: Vec<f64>,
}

impl IterationGrid {
    pub fn from_fn<F>(iterations: usize, steps: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> f64,
    {
        let mut values = Vec::with_capacity(iterations * steps);
        for iteration in 0..iterations {
            for step in 0..steps {
                values.push(f(iteration, step));
            }
        }
        Self { steps, values }
    }

    pub fn get(&self, iteration: usize, step: usize) -> f64 {
        self.values[iteration * self.steps + step]
    }

    pub fn row(&self, iteration: usize) -> &[f64] {
        let start = iteration * self.steps;
        &self.values[start..start + self.steps]
    }

    /// Sets every value for which `mask(iteration, value)` holds to `NaN`.
    pub fn mask_where<F>(&mut self, mut mask: F)
    where
        F: FnMut(usize, f64) -> bool,
    {
        if self.steps == 0 {
            return;
        }
        for (iteration, row) in self.values.chunks_mut(self.steps).enumerate() {
            for value in row.iter_mut() {
                if mask(iteration, *value) {
                    *value = f64::NAN;
                }
            }
        }
    }
}

/// Unit-spaced numerical gradient: centered differences in the interior,
/// one-sided differences at both ends, zero for a single point.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| {
                if i == 0 {
                    values[1] - values[0]
                } else if i == n - 1 {
                    values[n - 1] - values[n - 2]
                } else {
                    (values[i + 1] - values[i - 1]) / 2.0
                }
            })
            .collect(),
    }
}

/// Running sum of `rate * dt`.
pub fn weighted_cumsum(rates: &[f64], dt: &[f64]) -> Vec<f64> {
    let mut total = 0.0;
    rates
        .iter()
        .zip(dt)
        .map(|(rate, step)| {
            total += rate * step;
            total
        })
        .collect()
}

/// Evenly spaced values over `[start, stop]`, both ends included.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Population mean and standard deviation, ignoring non-finite values.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
