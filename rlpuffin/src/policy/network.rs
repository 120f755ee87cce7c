//! Small dense networks with analytic gradients.
//!
//! Parameters of a network are addressed as one flat vector: for every layer the
//! row-major weight matrix followed by the bias. Gradients use the same layout, which
//! lets the optimizer treat the whole network as a single slice.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    inputs: usize,
    outputs: usize,
    /// `outputs x inputs`, row-major
    weights: Vec<f64>,
    bias: Vec<f64>,
}

impl Dense {
    /// He-uniform initialisation, scaled by `gain`
    pub fn new<R: Rng>(inputs: usize, outputs: usize, gain: f64, rng: &mut R) -> Self {
        let limit = gain * (6.0 / inputs.max(1) as f64).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect();

        Self {
            inputs,
            outputs,
            weights,
            bias: vec![0.0; outputs],
        }
    }

    fn param_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    fn validate(&self) -> Result<(), String> {
        if self.weights.len() != self.inputs * self.outputs {
            return Err(format!(
                "{}x{} layer has {} weights",
                self.outputs,
                self.inputs,
                self.weights.len()
            ));
        }
        if self.bias.len() != self.outputs {
            return Err(format!(
                "layer with {} outputs has {} biases",
                self.outputs,
                self.bias.len()
            ));
        }
        Ok(())
    }

    fn forward(&self, input: &[f64], output: &mut Vec<f64>) {
        output.clear();
        output.extend(self.bias.iter().enumerate().map(|(row, bias)| {
            let weights = &self.weights[row * self.inputs..(row + 1) * self.inputs];
            bias + weights.iter().zip(input).map(|(w, x)| w * x).sum::<f64>()
        }));
    }

    /// Accumulates the parameter gradient into `grads` and returns the gradient with
    /// respect to the input.
    fn backward(&self, input: &[f64], grad_output: &[f64], grads: &mut [f64]) -> Vec<f64> {
        let (grad_weights, grad_bias) = grads.split_at_mut(self.weights.len());
        let mut grad_input = vec![0.0; self.inputs];

        for (row, &g) in grad_output.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            grad_bias[row] += g;
            let offset = row * self.inputs;
            for col in 0..self.inputs {
                grad_weights[offset + col] += g * input[col];
                grad_input[col] += g * self.weights[offset + col];
            }
        }

        grad_input
    }
}

/// Intermediate activations of one forward pass, needed by `Mlp::backward`
#[derive(Clone, Debug, Default)]
pub struct Activations {
    /// `layers[0]` is the network input, `layers[i + 1]` the output of layer `i`
    layers: Vec<Vec<f64>>,
}

impl Activations {
    pub fn output(&self) -> &[f64] {
        self.layers.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Multilayer perceptron with ReLU between layers and a linear output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    pub fn new<R: Rng>(
        inputs: usize,
        hidden: &[usize],
        outputs: usize,
        output_gain: f64,
        rng: &mut R,
    ) -> Self {
        let mut widths = Vec::with_capacity(hidden.len() + 2);
        widths.push(inputs);
        widths.extend_from_slice(hidden);
        widths.push(outputs);

        let last = widths.len() - 2;
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let gain = if i == last { output_gain } else { 1.0 };
                Dense::new(pair[0], pair[1], gain, rng)
            })
            .collect();

        Self { layers }
    }

    pub fn inputs(&self) -> usize {
        self.layers.first().map_or(0, |layer| layer.inputs)
    }

    pub fn outputs(&self) -> usize {
        self.layers.last().map_or(0, |layer| layer.outputs)
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Dense::param_count).sum()
    }

    /// Checks that the layers map `inputs` to `outputs`, chain into each other and hold
    /// as many parameters as their widths require.
    pub fn validate(&self, inputs: usize, outputs: usize) -> Result<(), String> {
        if self.layers.is_empty() {
            return Err("network has no layers".to_string());
        }
        if self.inputs() != inputs || self.outputs() != outputs {
            return Err(format!(
                "expected a {} -> {} network, found {} -> {}",
                inputs,
                outputs,
                self.inputs(),
                self.outputs()
            ));
        }
        for (i, pair) in self.layers.windows(2).enumerate() {
            if pair[0].outputs != pair[1].inputs {
                return Err(format!(
                    "layer {} has {} outputs but layer {} takes {} inputs",
                    i,
                    pair[0].outputs,
                    i + 1,
                    pair[1].inputs
                ));
            }
        }
        self.layers.iter().try_for_each(Dense::validate)
    }

    pub fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.forward_cached(input).layers.pop().unwrap_or_default()
    }

    pub fn forward_cached(&self, input: &[f64]) -> Activations {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(input.to_vec());

        for (i, layer) in self.layers.iter().enumerate() {
            let mut output = Vec::with_capacity(layer.outputs);
            layer.forward(&layers[i], &mut output);
            if i + 1 < self.layers.len() {
                output.iter_mut().for_each(|x| *x = x.max(0.0));
            }
            layers.push(output);
        }

        Activations { layers }
    }

    /// Backpropagates `grad_output` through the activations of a forward pass and adds
    /// the parameter gradient to `grads` (length `param_count`).
    pub fn backward(&self, activations: &Activations, grad_output: &[f64], grads: &mut [f64]) {
        let mut offsets = Vec::with_capacity(self.layers.len());
        let mut offset = 0;
        for layer in &self.layers {
            offsets.push(offset);
            offset += layer.param_count();
        }

        let mut grad = grad_output.to_vec();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let input = &activations.layers[i];
            let slot = &mut grads[offsets[i]..offsets[i] + layer.param_count()];
            let mut grad_input = layer.backward(input, &grad, slot);

            if i > 0 {
                // ReLU of the previous layer, `input` holds its post-activation output
                for (g, x) in grad_input.iter_mut().zip(input) {
                    if *x <= 0.0 {
                        *g = 0.0;
                    }
                }
            }
            grad = grad_input;
        }
    }

    pub fn params(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.param_count());
        for layer in &self.layers {
            params.extend_from_slice(&layer.weights);
            params.extend_from_slice(&layer.bias);
        }
        params
    }

    /// Applies `f(index, parameter)` to every parameter in flat order
    pub fn for_each_param_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, &mut f64),
    {
        let mut index = 0;
        for layer in &mut self.layers {
            for param in layer.weights.iter_mut().chain(layer.bias.iter_mut()) {
                f(index, param);
                index += 1;
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().chain(&l.bias).all(|p| p.is_finite()))
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test_log::test]
    fn test_shapes() {
        let mut rng = StdRng::seed_from_u64(7);
        let mlp = Mlp::new(5, &[8, 4], 3, 1.0, &mut rng);

        assert_eq!(mlp.inputs(), 5);
        assert_eq!(mlp.outputs(), 3);
        assert_eq!(mlp.param_count(), 5 * 8 + 8 + 8 * 4 + 4 + 4 * 3 + 3);
        assert_eq!(mlp.params().len(), mlp.param_count());
        assert_eq!(mlp.forward(&[0.1, 0.2, 0.3, 0.4, 0.5]).len(), 3);
    }

    #[test_log::test]
    fn test_validate_rejects_inconsistent_layers() {
        let mut rng = StdRng::seed_from_u64(5);
        let mlp = Mlp::new(5, &[4], 5, 1.0, &mut rng);
        mlp.validate(5, 5).unwrap();
        assert!(mlp.validate(5, 3).is_err());
        assert!(mlp.validate(4, 5).is_err());

        let mut short_weights = mlp.clone();
        short_weights.layers[0].weights.pop();
        assert!(short_weights.validate(5, 5).is_err());

        let mut short_bias = mlp.clone();
        short_bias.layers[1].bias.pop();
        assert!(short_bias.validate(5, 5).is_err());

        let mut broken_chain = mlp.clone();
        broken_chain.layers[1] = Dense::new(3, 5, 1.0, &mut rng);
        assert!(broken_chain.validate(5, 5).is_err());

        assert!(Mlp { layers: vec![] }.validate(5, 5).is_err());
    }

    /// Compares the analytic gradient of `sum(c_i * out_i)` with central differences
    #[test_log::test]
    fn test_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut mlp = Mlp::new(3, &[6], 2, 1.0, &mut rng);
        let input = [0.3, -0.7, 1.1];
        let coefficients = [0.8, -1.3];

        let objective = |mlp: &Mlp| -> f64 {
            mlp.forward(&input)
                .iter()
                .zip(coefficients)
                .map(|(o, c)| o * c)
                .sum()
        };

        let mut grads = vec![0.0; mlp.param_count()];
        let activations = mlp.forward_cached(&input);
        mlp.backward(&activations, &coefficients, &mut grads);

        let eps = 1e-6;
        for index in 0..mlp.param_count() {
            let shift = |mlp: &mut Mlp, delta: f64| {
                mlp.for_each_param_mut(|i, p| {
                    if i == index {
                        *p += delta
                    }
                })
            };
            shift(&mut mlp, eps);
            let plus = objective(&mlp);
            shift(&mut mlp, -2.0 * eps);
            let minus = objective(&mlp);
            shift(&mut mlp, eps);

            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                (numeric - grads[index]).abs() < 1e-5,
                "parameter {}: analytic {} numeric {}",
                index,
                grads[index],
                numeric
            );
        }
    }
}
