//! Multi-layer perceptron that maps input coordinates to an embedding, used
//! to extrapolate an embedding computed on a subset to every cell.

use crate::errors::DataError;
use anyhow::Result;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;

/// Training settings of [`RegressorModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegressorParams {
    pub hidden_layers: Vec<usize>,
    /// L2 penalty on the weights.
    pub l2_penalty: f64,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Minimum loss improvement that resets the patience counter.
    pub tolerance: f64,
    /// Epochs without improvement before training stops.
    pub patience: usize,
    pub seed: u64,
}

impl RegressorParams {
    pub fn new(l2_penalty: f64, seed: u64) -> Self {
        RegressorParams {
            hidden_layers: vec![100, 75, 50, 25],
            l2_penalty,
            learning_rate: 1e-3,
            batch_size: 200,
            max_epochs: 200,
            tolerance: 1e-4,
            patience: 10,
            seed,
        }
    }
}

/// Fewest training samples accepted for `input_dim` input columns.
pub fn min_samples(input_dim: usize) -> usize {
    10.max(input_dim + 1)
}

#[derive(Debug, Clone)]
struct Dense {
    weights: Array2<f64>,
    bias: Array1<f64>,
}

/// Column means and scales; constant columns get unit scale.
#[derive(Debug, Clone)]
struct Standardizer {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    fn fit(x: ArrayView2<'_, f64>) -> Self {
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 && s.is_finite() { s } else { 1.0 });
        Standardizer { mean, scale }
    }

    fn apply(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        (&x - &self.mean) / &self.scale
    }

    fn invert(&self, z: Array2<f64>) -> Array2<f64> {
        z * &self.scale + &self.mean
    }
}

fn check_finite(x: ArrayView2<'_, f64>, what: &str) -> Result<()> {
    if x.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DataError::new(format!("{what} contains non-finite values")).into())
    }
}

/// Fully connected ReLU network with a linear output layer, trained with
/// Adam on mean squared error.
#[derive(Debug, Clone)]
pub struct RegressorModel {
    layers: Vec<Dense>,
    x_norm: Standardizer,
    y_norm: Standardizer,
}

struct AdamState {
    m_w: Vec<Array2<f64>>,
    v_w: Vec<Array2<f64>>,
    m_b: Vec<Array1<f64>>,
    v_b: Vec<Array1<f64>>,
    t: i32,
}

impl RegressorModel {
    /// Train on `x -> y`. Fails with a [`DataError`] when there are fewer
    /// rows than [`min_samples`], the row counts differ or the input is not
    /// finite.
    pub fn fit(x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>, params: &RegressorParams) -> Result<Self> {
        let (n, d_in) = x.dim();
        let d_out = y.ncols();
        if y.nrows() != n {
            return Err(DataError::new(format!(
                "{n} input rows but {} target rows",
                y.nrows()
            ))
            .into());
        }
        if n < min_samples(d_in) {
            return Err(DataError::new(format!(
                "{n} training samples is below the minimum of {} for {d_in} input dimensions",
                min_samples(d_in)
            ))
            .into());
        }
        if d_in == 0 || d_out == 0 {
            return Err(DataError::new("regressor needs at least one input and one output column").into());
        }
        check_finite(x, "regressor input")?;
        check_finite(y, "regressor target")?;

        let x_norm = Standardizer::fit(x);
        let y_norm = Standardizer::fit(y);
        let xs = x_norm.apply(x);
        let ys = y_norm.apply(y);

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(params.seed);
        let sizes: Vec<usize> = std::iter::once(d_in)
            .chain(params.hidden_layers.iter().copied())
            .chain(std::iter::once(d_out))
            .collect();
        let layers: Vec<Dense> = sizes
            .windows(2)
            .map(|w| {
                let bound = (6.0 / (w[0] + w[1]) as f64).sqrt();
                Dense {
                    weights: Array2::from_shape_simple_fn((w[0], w[1]), || rng.gen_range(-bound..bound)),
                    bias: Array1::from_shape_simple_fn(w[1], || rng.gen_range(-bound..bound)),
                }
            })
            .collect();

        let mut model = RegressorModel {
            layers,
            x_norm,
            y_norm,
        };
        model.train(&xs, &ys, params, &mut rng);
        Ok(model)
    }

    fn forward(&self, x: Array2<f64>) -> Vec<Array2<f64>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x);
        for (i, layer) in self.layers.iter().enumerate() {
            let mut z = activations[i].dot(&layer.weights) + &layer.bias;
            if i + 1 < self.layers.len() {
                z.mapv_inplace(|v| v.max(0.0));
            }
            activations.push(z);
        }
        activations
    }

    fn train(&mut self, xs: &Array2<f64>, ys: &Array2<f64>, params: &RegressorParams, rng: &mut impl Rng) {
        let n = xs.nrows();
        let batch_size = params.batch_size.clamp(1, n);
        let mut adam = AdamState {
            m_w: self.layers.iter().map(|l| Array2::zeros(l.weights.dim())).collect(),
            v_w: self.layers.iter().map(|l| Array2::zeros(l.weights.dim())).collect(),
            m_b: self.layers.iter().map(|l| Array1::zeros(l.bias.len())).collect(),
            v_b: self.layers.iter().map(|l| Array1::zeros(l.bias.len())).collect(),
            t: 0,
        };
        let mut order: Vec<usize> = (0..n).collect();
        let mut best_loss = f64::INFINITY;
        let mut no_improvement = 0;

        for epoch in 0..params.max_epochs {
            order.shuffle(rng);
            let mut epoch_loss = 0.0;
            for batch in order.chunks(batch_size) {
                let xb = xs.select(Axis(0), batch);
                let yb = ys.select(Axis(0), batch);
                let loss = self.step(xb, &yb, params, &mut adam);
                epoch_loss += loss * batch.len() as f64;
            }
            epoch_loss /= n as f64;
            debug!("regressor epoch {epoch}: loss {epoch_loss:.6}");

            if epoch_loss > best_loss - params.tolerance {
                no_improvement += 1;
            } else {
                no_improvement = 0;
            }
            best_loss = best_loss.min(epoch_loss);
            if no_improvement >= params.patience {
                info!("regressor converged after {} epochs, loss {best_loss:.6}", epoch + 1);
                return;
            }
        }
        info!(
            "regressor stopped after {} epochs, loss {best_loss:.6}",
            params.max_epochs
        );
    }

    /// One Adam update on a mini-batch; returns the batch loss.
    fn step(&mut self, xb: Array2<f64>, yb: &Array2<f64>, params: &RegressorParams, adam: &mut AdamState) -> f64 {
        let b = xb.nrows() as f64;
        let activations = self.forward(xb);
        let Some(output) = activations.last() else {
            return 0.0;
        };
        let mut delta = output - yb;
        let penalty: f64 = self
            .layers
            .iter()
            .map(|l| l.weights.iter().map(|w| w * w).sum::<f64>())
            .sum();
        let loss = delta.iter().map(|d| d * d).sum::<f64>() / (2.0 * delta.len() as f64)
            + 0.5 * params.l2_penalty * penalty / b;

        adam.t += 1;
        let lr_t = params.learning_rate * (1.0 - ADAM_BETA2.powi(adam.t)).sqrt()
            / (1.0 - ADAM_BETA1.powi(adam.t));

        for i in (0..self.layers.len()).rev() {
            let grad_w = (activations[i].t().dot(&delta) + &self.layers[i].weights * params.l2_penalty) / b;
            let grad_b = delta.sum_axis(Axis(0)) / b;
            if i > 0 {
                let mut next = delta.dot(&self.layers[i].weights.t());
                ndarray::Zip::from(&mut next)
                    .and(&activations[i])
                    .for_each(|g, &a| {
                        if a <= 0.0 {
                            *g = 0.0;
                        }
                    });
                delta = next;
            }

            let layer = &mut self.layers[i];
            ndarray::Zip::from(&mut layer.weights)
                .and(&mut adam.m_w[i])
                .and(&mut adam.v_w[i])
                .and(&grad_w)
                .for_each(|w, m, v, &g| {
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                    *w -= lr_t * *m / (v.sqrt() + ADAM_EPSILON);
                });
            ndarray::Zip::from(&mut layer.bias)
                .and(&mut adam.m_b[i])
                .and(&mut adam.v_b[i])
                .and(&grad_b)
                .for_each(|w, m, v, &g| {
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                    *w -= lr_t * *m / (v.sqrt() + ADAM_EPSILON);
                });
        }
        loss
    }

    pub fn input_dim(&self) -> usize {
        self.x_norm.mean.len()
    }

    pub fn output_dim(&self) -> usize {
        self.y_norm.mean.len()
    }

    /// Predict one output row per input row, in input order.
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.input_dim() {
            return Err(DataError::new(format!(
                "regressor was trained on {} input dimensions, got {}",
                self.input_dim(),
                x.ncols()
            ))
            .into());
        }
        check_finite(x, "prediction input")?;
        let mut activations = self.forward(self.x_norm.apply(x));
        let z = activations
            .pop()
            .unwrap_or_else(|| Array2::zeros((x.nrows(), self.output_dim())));
        Ok(self.y_norm.invert(z))
    }
}
