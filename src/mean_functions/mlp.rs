use super::MeanFunction;
use crate::errors::{NnglsError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hidden layers activation function
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Activation {
    /// max(0, z)
    #[default]
    Relu,
    /// tanh(z)
    Tanh,
    /// 1 / (1 + exp(-z))
    Sigmoid,
}

impl Activation {
    fn apply<F: Float>(&self, z: F) -> F {
        match self {
            Activation::Relu => z.max(F::zero()),
            Activation::Tanh => z.tanh(),
            Activation::Sigmoid => F::one() / (F::one() + F::exp(-z)),
        }
    }

    /// Derivative expressed with the pre-activation `z` and the activation `a`
    fn derivative<F: Float>(&self, z: F, a: F) -> F {
        match self {
            Activation::Relu => {
                if z > F::zero() {
                    F::one()
                } else {
                    F::zero()
                }
            }
            Activation::Tanh => F::one() - a * a,
            Activation::Sigmoid => a * (F::one() - a),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Activation::Relu => write!(f, "Relu"),
            Activation::Tanh => write!(f, "Tanh"),
            Activation::Sigmoid => write!(f, "Sigmoid"),
        }
    }
}

/// Feed-forward neural network with a scalar linear output.
///
/// Layer `l` computes `a_l = act(a_{l-1} . W_l + b_l)` with `W_l` of shape (n_in, n_out),
/// the last layer being linear. Parameters are flattened as `W_1, b_1, W_2, b_2, ...`
/// (row-major weights).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct Mlp<F: Float> {
    layer_sizes: Vec<usize>,
    activation: Activation,
    weights: Vec<Array2<F>>,
    biases: Vec<Array1<F>>,
}

impl<F: Float> Mlp<F> {
    /// Network with `n_inputs` covariates, the given `hidden` layer widths and a scalar output.
    /// Weights are drawn with the Glorot uniform scheme from a generator seeded by `seed`,
    /// biases are zero.
    pub fn new(n_inputs: usize, hidden: &[usize], activation: Activation, seed: u64) -> Result<Self> {
        if n_inputs == 0 || hidden.contains(&0) {
            return Err(NnglsError::InvalidConfigError(
                "layer sizes should be positive".to_string(),
            ));
        }
        let mut layer_sizes = vec![n_inputs];
        layer_sizes.extend_from_slice(hidden);
        layer_sizes.push(1);

        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let mut weights = Vec::with_capacity(layer_sizes.len() - 1);
        let mut biases = Vec::with_capacity(layer_sizes.len() - 1);
        for w in layer_sizes.windows(2) {
            let limit = (6. / (w[0] + w[1]) as f64).sqrt();
            let wl = Array2::random_using((w[0], w[1]), Uniform::new(-limit, limit), &mut rng)
                .mapv(|v| F::cast(v));
            weights.push(wl);
            biases.push(Array1::zeros(w[1]));
        }
        Ok(Mlp {
            layer_sizes,
            activation,
            weights,
            biases,
        })
    }

    /// Layer sizes from input to output
    pub fn layer_sizes(&self) -> &[usize] {
        &self.layer_sizes
    }

    /// Hidden layers activation
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Forward pass keeping (pre-activations, activations) of every layer,
    /// activations[0] being the input
    fn forward(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> (Vec<Array2<F>>, Vec<Array2<F>>) {
        let n_layers = self.weights.len();
        let mut pre = Vec::with_capacity(n_layers);
        let mut acts = Vec::with_capacity(n_layers + 1);
        acts.push(x.to_owned());
        for (l, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            let z = acts[l].dot(w) + b;
            let a = if l + 1 < n_layers {
                z.mapv(|v| self.activation.apply(v))
            } else {
                z.to_owned()
            };
            pre.push(z);
            acts.push(a);
        }
        (pre, acts)
    }
}

impl<F: Float> fmt::Display for Mlp<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Mlp(layers={:?}, activation={})", self.layer_sizes, self.activation)
    }
}

impl<F: Float> MeanFunction<F> for Mlp<F> {
    fn n_inputs(&self) -> usize {
        self.layer_sizes[0]
    }

    fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        let (_, mut acts) = self.forward(x);
        acts.pop()
            .map(|a| a.column(0).to_owned())
            .unwrap_or_else(|| Array1::zeros(x.nrows()))
    }

    fn parameters(&self) -> Array1<F> {
        let mut params = Vec::new();
        for (w, b) in self.weights.iter().zip(&self.biases) {
            params.extend(w.iter());
            params.extend(b.iter());
        }
        Array1::from(params)
    }

    fn set_parameters(&mut self, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        let expected: usize = self
            .weights
            .iter()
            .zip(&self.biases)
            .map(|(w, b)| w.len() + b.len())
            .sum();
        if params.len() != expected {
            return Err(NnglsError::InvalidConfigError(format!(
                "expected {expected} parameters, got {}",
                params.len()
            )));
        }
        let mut o = 0;
        for (w, b) in self.weights.iter_mut().zip(self.biases.iter_mut()) {
            let (r, c) = w.dim();
            // weights are stored in standard (row-major) layout
            w.iter_mut()
                .zip(params.slice(s![o..o + r * c]).iter())
                .for_each(|(wv, &pv)| *wv = pv);
            o += r * c;
            b.assign(&params.slice(s![o..o + c]));
            o += c;
        }
        Ok(())
    }

    fn gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        dloss_dpred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        let (pre, acts) = self.forward(x);
        let n_layers = self.weights.len();
        let mut grads_w = vec![Array2::zeros((0, 0)); n_layers];
        let mut grads_b = vec![Array1::zeros(0); n_layers];

        let mut delta = dloss_dpred.to_owned().insert_axis(Axis(1));
        for l in (0..n_layers).rev() {
            grads_w[l] = acts[l].t().dot(&delta);
            grads_b[l] = delta.sum_axis(Axis(0));
            if l > 0 {
                let back = delta.dot(&self.weights[l].t());
                delta = ndarray::Zip::from(&back)
                    .and(&pre[l - 1])
                    .and(&acts[l])
                    .map_collect(|&g, &z, &a| g * self.activation.derivative(z, a));
            }
        }

        let mut flat = Vec::new();
        for (gw, gb) in grads_w.iter().zip(&grads_b) {
            flat.extend(gw.iter());
            flat.extend(gb.iter());
        }
        Array1::from(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn central_diff(f: impl Fn(&Array1<f64>) -> f64, p: &Array1<f64>) -> Array1<f64> {
        let h = 1e-6;
        Array1::from_shape_fn(p.len(), |i| {
            let mut pp = p.to_owned();
            let mut pm = p.to_owned();
            pp[i] += h;
            pm[i] -= h;
            (f(&pp) - f(&pm)) / (2. * h)
        })
    }

    #[test]
    fn test_mlp_shapes() {
        let mlp = Mlp::<f64>::new(3, &[5, 4], Activation::Relu, 42).unwrap();
        assert_eq!(mlp.layer_sizes(), &[3, 5, 4, 1]);
        assert_eq!(mlp.parameters().len(), 3 * 5 + 5 + 5 * 4 + 4 + 4 + 1);
        let x = array![[0.1, 0.2, 0.3], [1., 2., 3.]];
        assert_eq!(mlp.predict(&x).len(), 2);
        assert!(Mlp::<f64>::new(3, &[0], Activation::Relu, 42).is_err());
    }

    #[test]
    fn test_parameters_roundtrip() {
        let mut mlp = Mlp::<f64>::new(2, &[3], Activation::Tanh, 1).unwrap();
        let p = mlp.parameters().mapv(|v| v + 0.5);
        mlp.set_parameters(&p).unwrap();
        assert_eq!(mlp.parameters(), p);
        assert!(mlp.set_parameters(&array![1.]).is_err());
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        for activation in [Activation::Tanh, Activation::Sigmoid] {
            let mlp = Mlp::<f64>::new(2, &[4, 3], activation, 7).unwrap();
            let x = array![[0.1, -0.4], [0.7, 0.2], [-0.3, 0.9]];
            let y = array![0.5, -1., 0.2];
            let loss = |p: &Array1<f64>| {
                let mut m = mlp.clone();
                m.set_parameters(p).unwrap();
                (m.predict(&x) - &y).mapv(|v| v * v).sum()
            };
            let pred = mlp.predict(&x);
            let dpred = (pred - &y).mapv(|v| 2. * v);
            let grad = mlp.gradient(&x, &dpred);
            let expected = central_diff(loss, &mlp.parameters());
            assert_abs_diff_eq!(grad, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_linear_network_without_hidden_layer() {
        let mut mlp = Mlp::<f64>::new(2, &[], Activation::Relu, 0).unwrap();
        mlp.set_parameters(&array![1., 2., 0.5]).unwrap();
        assert_abs_diff_eq!(
            mlp.predict(&array![[1., 1.], [0., 2.]]),
            array![3.5, 4.5],
            epsilon = 1e-12
        );
    }
}
