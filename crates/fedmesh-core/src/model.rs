//! Model capability and a small reference network.
//!
//! The fabric only needs to read and overwrite a flat weight vector and to
//! (re)build a model from [`Parameters`]. [`FeedForward`] is the network the
//! daemon trains locally: dense layers with no biases, one activation for
//! every layer, squared-error loss.

use rand::Rng;

use crate::wire::{Activation, Parameters};

/// What the coordination layer needs from a model.
pub trait Model: Send + 'static {
    /// Rebuild the model for the given topology, discarding current weights.
    fn initialize(&mut self, params: &Parameters);

    /// Flattened weights, layer by layer.
    fn weights(&self) -> Vec<f64>;

    /// Overwrite every weight. The length must match [`Model::weights`].
    fn set_weights(&mut self, weights: &[f64]) -> Result<(), ModelError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("expected {expected} weights, got {got}")]
    WeightCount { expected: usize, got: usize },

    #[error("input has {got} values, model expects {expected}")]
    InputDimensions { expected: usize, got: usize },

    #[error("target has {got} values, model produces {expected}")]
    OutputDimensions { expected: usize, got: usize },

    #[error("model has not been initialized")]
    Uninitialized,
}

// ── FeedForward ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Layer {
    inputs: usize,
    outputs: usize,
    /// Row-major: `weights[o * inputs + i]` connects input `i` to output `o`.
    weights: Vec<f64>,
}

impl Layer {
    fn random(inputs: usize, outputs: usize, rng: &mut impl Rng) -> Self {
        Self {
            inputs,
            outputs,
            weights: (0..inputs * outputs).map(|_| rng.gen::<f64>()).collect(),
        }
    }

    fn weight(&self, output: usize, input: usize) -> f64 {
        self.weights[output * self.inputs + input]
    }
}

/// Dense network: input → `nb_layers` hidden layers of `nb_neurons` → output.
#[derive(Debug, Clone, Default)]
pub struct FeedForward {
    layers: Vec<Layer>,
    activation: Activation,
    learning_rate: f64,
}

impl FeedForward {
    pub fn new(params: &Parameters) -> Self {
        let mut network = Self::default();
        network.initialize(params);
        network
    }

    pub fn is_initialized(&self) -> bool {
        !self.layers.is_empty()
    }

    /// `(inputs, outputs)` of every layer.
    pub fn shape(&self) -> Vec<(usize, usize)> {
        self.layers.iter().map(|l| (l.inputs, l.outputs)).collect()
    }

    pub fn weight_count(&self) -> usize {
        self.layers.iter().map(|l| l.weights.len()).sum()
    }

    /// Activations of every layer, the input included as the first entry.
    pub fn forward(&self, input: &[f64]) -> Result<Vec<Vec<f64>>, ModelError> {
        let first = self.layers.first().ok_or(ModelError::Uninitialized)?;
        if input.len() != first.inputs {
            return Err(ModelError::InputDimensions {
                expected: first.inputs,
                got: input.len(),
            });
        }

        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.to_vec());
        for layer in &self.layers {
            let prev = &activations[activations.len() - 1];
            let next: Vec<f64> = (0..layer.outputs)
                .map(|o| {
                    let z: f64 = prev.iter().enumerate().map(|(i, x)| x * layer.weight(o, i)).sum();
                    self.activate(z)
                })
                .collect();
            activations.push(next);
        }
        Ok(activations)
    }

    pub fn predict(&self, input: &[f64]) -> Result<Vec<f64>, ModelError> {
        let mut activations = self.forward(input)?;
        activations.pop().ok_or(ModelError::Uninitialized)
    }

    /// Gradient of `0.5 * |prediction - target|²` for every weight, in the
    /// same layout as [`Model::weights`], and the loss itself.
    pub fn gradients(&self, input: &[f64], target: &[f64]) -> Result<(Vec<f64>, f64), ModelError> {
        let activations = self.forward(input)?;
        let output = &activations[activations.len() - 1];
        if target.len() != output.len() {
            return Err(ModelError::OutputDimensions {
                expected: output.len(),
                got: target.len(),
            });
        }

        let loss = 0.5
            * output
                .iter()
                .zip(target)
                .map(|(y, t)| (y - t).powi(2))
                .sum::<f64>();

        let mut delta: Vec<f64> = output
            .iter()
            .zip(target)
            .map(|(y, t)| (y - t) * self.derivative(*y))
            .collect();

        let mut per_layer: Vec<Vec<f64>> = vec![Vec::new(); self.layers.len()];
        for (l, layer) in self.layers.iter().enumerate().rev() {
            let prev = &activations[l];
            per_layer[l] = (0..layer.outputs)
                .flat_map(move |o| prev.iter().map(move |x| (o, *x)))
                .map(|(o, x)| delta[o] * x)
                .collect();

            if l > 0 {
                delta = (0..layer.inputs)
                    .map(|i| {
                        let back: f64 = (0..layer.outputs).map(|o| layer.weight(o, i) * delta[o]).sum();
                        back * self.derivative(prev[i])
                    })
                    .collect();
            }
        }

        Ok((per_layer.concat(), loss))
    }

    /// One SGD step on a single sample. Returns the loss before the update.
    pub fn train_step(&mut self, input: &[f64], target: &[f64]) -> Result<f64, ModelError> {
        let (grads, loss) = self.gradients(input, target)?;
        let lr = self.learning_rate;
        let updated: Vec<f64> = self
            .weights()
            .iter()
            .zip(&grads)
            .map(|(w, g)| w - lr * g)
            .collect();
        self.set_weights(&updated)?;
        Ok(loss)
    }

    fn activate(&self, z: f64) -> f64 {
        match self.activation {
            Activation::Sigmoid => 1.0 / (1.0 + (-z).exp()),
            Activation::Relu => z.max(0.0),
        }
    }

    /// Derivative expressed through the activation's output.
    fn derivative(&self, a: f64) -> f64 {
        match self.activation {
            Activation::Sigmoid => a * (1.0 - a),
            Activation::Relu => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl Model for FeedForward {
    /// A topology rejected by [`Parameters::validate`] leaves the network
    /// uninitialized.
    fn initialize(&mut self, params: &Parameters) {
        if params.validate().is_err() {
            self.layers.clear();
            return;
        }
        let mut rng = rand::thread_rng();
        let mut widths = vec![params.input_dimensions];
        widths.extend(std::iter::repeat(params.nb_neurons).take(params.nb_layers));
        widths.push(params.output_dimensions);

        self.layers = widths
            .windows(2)
            .map(|w| Layer::random(w[0], w[1], &mut rng))
            .collect();
        self.activation = params.activation_function;
        self.learning_rate = params.learning_rate;
    }

    fn weights(&self) -> Vec<f64> {
        self.layers.iter().flat_map(|l| l.weights.iter().copied()).collect()
    }

    fn set_weights(&mut self, weights: &[f64]) -> Result<(), ModelError> {
        let expected = self.weight_count();
        if weights.len() != expected {
            return Err(ModelError::WeightCount {
                expected,
                got: weights.len(),
            });
        }
        let mut offset = 0;
        for layer in &mut self.layers {
            let n = layer.weights.len();
            layer.weights.copy_from_slice(&weights[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }
}
