use std::{cmp, iter::zip, ops};

use itertools::{EitherOrBoth, Itertools};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    Rng, SeedableRng,
};
use serde::{Deserialize, Serialize};

/// Owned, row-major `f64` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    #[serde(with = "wire_data")]
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
}

/// JSON has no literal for non-finite floats. They travel as the strings
/// `"NaN"`, `"Infinity"` and `"-Infinity"`.
mod wire_data {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Value {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(data: &[f64], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(data.iter().map(|&x| {
            if x.is_nan() {
                Value::Text("NaN".to_string())
            } else if x.is_infinite() {
                let sign = if x < 0.0 { "-" } else { "" };
                Value::Text(format!("{sign}Infinity"))
            } else {
                Value::Number(x)
            }
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Value>::deserialize(d)?
            .into_iter()
            .map(|value| match value {
                Value::Number(x) => Ok(x),
                Value::Text(text) => match text.as_str() {
                    "NaN" => Ok(f64::NAN),
                    "Infinity" => Ok(f64::INFINITY),
                    "-Infinity" => Ok(f64::NEG_INFINITY),
                    other => Err(de::Error::custom(format!("invalid tensor value {other:?}"))),
                },
            })
            .collect()
    }
}

pub fn broadcastable(shape1: &[usize], shape2: &[usize]) -> bool {
    shape1
        .iter()
        .rev()
        .zip_longest(shape2.iter().rev())
        .all(|dim_pair| match dim_pair {
            EitherOrBoth::Both(left, right) => left == right || *left == 1 || *right == 1,
            EitherOrBoth::Left(_) | EitherOrBoth::Right(_) => true,
        })
}

fn broadcast_shape(shape1: &[usize], shape2: &[usize]) -> Vec<usize> {
    let mut shape: Vec<usize> = shape1
        .iter()
        .rev()
        .zip_longest(shape2.iter().rev())
        .map(|dim_pair| match dim_pair {
            EitherOrBoth::Both(left, right) => cmp::max(*left, *right),
            EitherOrBoth::Left(dim) | EitherOrBoth::Right(dim) => *dim,
        })
        .collect();
    shape.reverse();
    shape
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

// Strides of `shape` viewed through `out_shape`: missing leading dims and
// dims of size 1 get stride 0.
fn broadcast_strides(shape: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let offset = out_shape.len() - shape.len();
    let strides = contiguous_strides(shape);

    (0..out_shape.len())
        .map(|d| {
            if d < offset || shape[d - offset] == 1 {
                0
            } else {
                strides[d - offset]
            }
        })
        .collect()
}

// Advances a multi-dimensional index in row-major order.
fn next_index(index: &mut [usize], shape: &[usize]) {
    for d in (0..shape.len()).rev() {
        index[d] += 1;
        if index[d] < shape[d] {
            return;
        }
        index[d] = 0;
    }
}

fn offset(index: &[usize], strides: &[usize]) -> usize {
    zip(index, strides).map(|(i, s)| i * s).sum()
}

type BroadcastOp = fn(lhs: f64, rhs: f64) -> f64;

fn broadcast_op(lhs: &Tensor, rhs: &Tensor, op: BroadcastOp) -> Tensor {
    assert!(
        broadcastable(&lhs.shape, &rhs.shape),
        "shapes {:?} and {:?} are not broadcastable",
        lhs.shape,
        rhs.shape
    );
    assert!(
        !lhs.data.is_empty() && !rhs.data.is_empty(),
        "cannot broadcast an empty tensor"
    );

    if lhs.shape == rhs.shape {
        let data = zip(&lhs.data, &rhs.data).map(|(l, r)| op(*l, *r)).collect();
        return Tensor::new(data, lhs.shape.clone());
    }

    let output_shape = broadcast_shape(&lhs.shape, &rhs.shape);
    let lhs_strides = broadcast_strides(&lhs.shape, &output_shape);
    let rhs_strides = broadcast_strides(&rhs.shape, &output_shape);

    let len = output_shape.iter().product();
    let mut index = vec![0; output_shape.len()];
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        data.push(op(
            lhs.data[offset(&index, &lhs_strides)],
            rhs.data[offset(&index, &rhs_strides)],
        ));
        next_index(&mut index, &output_shape);
    }

    Tensor::new(data, output_shape)
}

macro_rules! impl_broadcast_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait<Tensor> for Tensor {
            type Output = Tensor;

            fn $method(self, rhs: Tensor) -> Self::Output {
                broadcast_op(&self, &rhs, $op)
            }
        }

        impl ops::$trait<&Tensor> for &Tensor {
            type Output = Tensor;

            fn $method(self, rhs: &Tensor) -> Self::Output {
                broadcast_op(self, rhs, $op)
            }
        }

        impl ops::$trait<f64> for Tensor {
            type Output = Tensor;

            fn $method(self, rhs: f64) -> Self::Output {
                let op: BroadcastOp = $op;
                self.map(|x| op(x, rhs))
            }
        }

        impl ops::$trait<f64> for &Tensor {
            type Output = Tensor;

            fn $method(self, rhs: f64) -> Self::Output {
                let op: BroadcastOp = $op;
                self.map(|x| op(x, rhs))
            }
        }
    };
}

impl_broadcast_op!(Add, add, |x1, x2| x1 + x2);
impl_broadcast_op!(Sub, sub, |x1, x2| x1 - x2);
impl_broadcast_op!(Mul, mul, |x1, x2| x1 * x2);
impl_broadcast_op!(Div, div, |x1, x2| x1 / x2);

impl ops::Add<Tensor> for f64 {
    type Output = Tensor;

    fn add(self, rhs: Tensor) -> Self::Output {
        rhs.map(|x| self + x)
    }
}

impl ops::Mul<Tensor> for f64 {
    type Output = Tensor;

    fn mul(self, rhs: Tensor) -> Self::Output {
        rhs.map(|x| self * x)
    }
}

impl Tensor {
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Tensor {
        // empty tensors are an exception
        if !(data.is_empty() && shape.is_empty()) {
            assert_eq!(
                data.len(),
                shape.iter().product::<usize>(),
                "invalid shape for data length"
            );
        }

        Tensor { data, shape }
    }

    pub fn empty() -> Tensor {
        Tensor {
            data: vec![],
            shape: vec![],
        }
    }

    pub fn from_scalar(data: f64) -> Tensor {
        Tensor::new(vec![data], vec![1])
    }

    pub fn from_vec(data: Vec<f64>) -> Tensor {
        let len = data.len();
        Tensor::new(data, vec![len])
    }

    pub fn full(shape: Vec<usize>, value: f64) -> Tensor {
        Tensor::new(vec![value; shape.iter().product()], shape)
    }

    pub fn zeros(size: usize) -> Tensor {
        Tensor::full(vec![size], 0.0)
    }

    pub fn ones(size: usize) -> Tensor {
        Tensor::full(vec![size], 1.0)
    }

    pub fn rand(shape: Vec<usize>) -> Tensor {
        Tensor::sample(shape, (-1.0, 1.0), &mut rand::thread_rng())
    }

    pub fn rand_with_range(shape: Vec<usize>, range: (f64, f64)) -> Tensor {
        Tensor::sample(shape, range, &mut rand::thread_rng())
    }

    /// Uniform samples in `[-1, 1)`, reproducible for a given seed.
    pub fn rand_seeded(shape: Vec<usize>, seed: u64) -> Tensor {
        Tensor::sample(shape, (-1.0, 1.0), &mut StdRng::seed_from_u64(seed))
    }

    fn sample<R: Rng>(shape: Vec<usize>, range: (f64, f64), rng: &mut R) -> Tensor {
        let uniform = Uniform::new(range.0, range.1);
        let data: Vec<f64> = (0..shape.iter().product::<usize>())
            .map(|_| uniform.sample(rng))
            .collect();

        Tensor::new(data, shape)
    }

    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Tensor {
        Tensor::new(self.data.iter().map(|x| f(*x)).collect(), self.shape.clone())
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f64::sqrt)
    }

    pub fn rsqrt(&self) -> Tensor {
        self.map(|x| 1.0 / x.sqrt())
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn size(&self, dim: Option<usize>) -> Vec<usize> {
        if let Some(dim) = dim {
            vec![self.shape[dim]]
        } else {
            self.shape.clone()
        }
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Tensor {
        assert_eq!(
            self.numel(),
            shape.iter().product::<usize>(),
            "cannot reshape {:?} into {:?}",
            self.shape,
            shape
        );
        Tensor::new(self.data.clone(), shape)
    }

    pub fn expand(&self, shape: Vec<usize>) -> Tensor {
        let expanded = broadcast_op(self, &Tensor::full(shape.clone(), 0.0), |x, _| x);
        assert_eq!(
            expanded.shape, shape,
            "cannot expand {:?} into {:?}",
            self.shape, shape
        );
        expanded
    }

    /// Sums over `dims` (every dim when `None`). Without `keepdim` the reduced
    /// dims are dropped; a full reduction yields shape `[1]`.
    pub fn reduce_sum(&self, dims: Option<&Vec<usize>>, keepdim: bool) -> Tensor {
        let all_dims: Vec<usize> = (0..self.shape.len()).collect();
        let dims = dims.unwrap_or(&all_dims);
        for dim in dims {
            assert!(
                *dim < self.shape.len(),
                "dim {dim} out of range for shape {:?}",
                self.shape
            );
        }

        let kept_shape: Vec<usize> = self
            .shape
            .iter()
            .enumerate()
            .map(|(i, d)| if dims.contains(&i) { 1 } else { *d })
            .collect();
        let result_strides = broadcast_strides(&kept_shape, &self.shape);

        let mut result = vec![0.0; kept_shape.iter().product()];
        let mut index = vec![0; self.shape.len()];
        for elem in &self.data {
            result[offset(&index, &result_strides)] += elem;
            next_index(&mut index, &self.shape);
        }

        let new_shape = if keepdim {
            kept_shape
        } else {
            let reduced: Vec<usize> = self
                .shape
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, d)| *d)
                .collect();
            if reduced.is_empty() {
                vec![1]
            } else {
                reduced
            }
        };

        Tensor::new(result, new_shape)
    }

    pub fn reduce_mean(
        &self,
        dims: Option<&Vec<usize>>,
        keepdim: bool,
        correction: Option<f64>,
    ) -> Tensor {
        let divisor = match dims {
            Some(dims) => dims.iter().map(|dim| self.shape[*dim] as f64).product::<f64>(),
            None => self.numel() as f64,
        };

        // torch clamps the degrees of freedom at zero, so n <= correction gives nan or inf
        self.reduce_sum(dims, keepdim) / (divisor - correction.unwrap_or(0.0)).max(0.0)
    }

    /// Variance over `dims`, Bessel-corrected by default like torch.
    pub fn variance(&self, dims: Option<&Vec<usize>>, correction: Option<f64>) -> Tensor {
        let mean = self.reduce_mean(dims, true, None);
        let diff = self - &mean;
        (&diff * &diff).reduce_mean(dims, false, correction.or(Some(1.0)))
    }
}
