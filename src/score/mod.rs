mod cpu;
mod kernel;


use crate::{Error, Result};
use any_tensor::digit_layout::types;
use half::f16;
use kernel::{Geometry, View, store, to_bytes};
use std::iter::zip;
use tracing::debug;

pub type Tensor<T> = any_tensor::Tensor<T, 3>;

/// 输入张量前两维的含义
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum AxisOrder {
    /// \[batch, seq, hidden]
    #[default]
    BatchFirst,
    /// \[seq, batch, hidden]
    SeqFirst,
}

/// q 和 k 在 hidden 维上的排布
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum Operands {
    /// q 与 k 是同一段：hidden = heads * d
    #[default]
    Shared,
    /// 每个头依次存放 q、k：hidden = heads * 2d
    Interleaved,
}

impl Operands {
    const fn width(self) -> usize {
        match self {
            Self::Shared => 1,
            Self::Interleaved => 2,
        }
    }
}

/// 点积的累加精度，输入输出始终是半精度
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum Accumulate {
    #[default]
    Single,
    Double,
}

#[derive(Clone, Debug)]
pub struct RawScoreCfg {
    pub heads: usize,
    pub axes: AxisOrder,
    pub operands: Operands,
    pub accumulate: Accumulate,
    /// 每个并行单元处理的 q 行数
    pub tile_seq: usize,
}

impl RawScoreCfg {
    pub const fn new(heads: usize) -> Self {
        Self {
            heads,
            axes: AxisOrder::BatchFirst,
            operands: Operands::Shared,
            accumulate: Accumulate::Single,
            tile_seq: 16,
        }
    }

    /// 由 hidden 维推出每个头的宽度
    pub fn head_dim(&self, hidden: usize) -> Result<usize> {
        let &Self {
            heads, operands, ..
        } = self;
        if heads == 0 {
            return Err(Error::shape("heads", "must be positive"));
        }
        let packed = heads * operands.width();
        if hidden % packed != 0 {
            return Err(Error::shape(
                "inputs",
                format!("hidden = {hidden} is not divisible by {heads} heads x {operands:?}"),
            ));
        }
        Ok(hidden / packed)
    }

    /// 1 / √d
    pub fn default_coeff(&self, hidden: usize) -> Result<f32> {
        Ok((self.head_dim(hidden)? as f32).sqrt().recip())
    }

    pub fn forward(&self, inputs: Tensor<&[u8]>, coeff: f32) -> Result<Tensor<Box<[u8]>>> {
        check_rank("inputs", &inputs)?;
        check_dtype("inputs", &inputs)?;

        let inputs = View::new("inputs", inputs)?;
        let geo = self.geometry(inputs.dims(self.axes))?;
        self.log("forward", &geo, coeff);

        let scores = match self.accumulate {
            Accumulate::Single => {
                let x = inputs.load::<f32>(self.axes);
                cpu::forward(&geo, &x, coeff, self.tile_seq)
            }
            Accumulate::Double => {
                let x = inputs.load::<f64>(self.axes);
                cpu::forward(&geo, &x, coeff, self.tile_seq)
            }
        };
        Ok(Tensor::from_dim_slice(types::F16, geo.score_shape()).map(|_| to_bytes(scores)))
    }

    pub fn backward(
        &self,
        output_grads: Tensor<&[u8]>,
        inputs: Tensor<&[u8]>,
        coeff: f32,
    ) -> Result<Tensor<Box<[u8]>>> {
        check_rank("output_grads", &output_grads)?;
        check_rank("inputs", &inputs)?;
        check_dtype("output_grads", &output_grads)?;
        check_dtype("inputs", &inputs)?;

        let output_grads = View::new("output_grads", output_grads)?;
        let inputs = View::new("inputs", inputs)?;
        let geo = self.geometry(inputs.dims(self.axes))?;
        // 分数张量总是 batch 在前
        let g_shape = output_grads.dims(AxisOrder::BatchFirst);
        if g_shape != geo.score_shape() {
            return Err(Error::shape(
                "output_grads",
                format!("expected {:?}, got {g_shape:?}", geo.score_shape()),
            ));
        }
        self.log("backward", &geo, coeff);

        let grads = match self.accumulate {
            Accumulate::Single => {
                let g = output_grads.load::<f32>(AxisOrder::BatchFirst);
                let dx = cpu::backward(&geo, &g, &inputs.load::<f32>(self.axes), coeff);
                store(&dx, &geo, self.axes)
            }
            Accumulate::Double => {
                let g = output_grads.load::<f64>(AxisOrder::BatchFirst);
                let dx = cpu::backward(&geo, &g, &inputs.load::<f64>(self.axes), coeff);
                store(&dx, &geo, self.axes)
            }
        };
        Ok(Tensor::from_dim_slice(types::F16, geo.input_shape(self.axes)).map(|_| grads))
    }

    fn log(&self, op: &str, geo: &Geometry, coeff: f32) {
        let &Geometry {
            batch,
            seq,
            hidden,
            heads,
            d,
            ..
        } = geo;
        debug!(
            op,
            batch,
            seq,
            hidden,
            heads,
            d,
            coeff,
            axes = ?self.axes,
            operands = ?self.operands,
            accumulate = ?self.accumulate,
            "raw attention score"
        );
    }
}

/// 以默认配置计算 `heads` 个头的原始注意力分数
pub fn forward(heads: usize, inputs: Tensor<&[u8]>, coeff: f32) -> Result<Tensor<Box<[u8]>>> {
    RawScoreCfg::new(heads).forward(inputs, coeff)
}

/// 以默认配置将分数梯度反传到输入
pub fn backward(
    heads: usize,
    output_grads: Tensor<&[u8]>,
    inputs: Tensor<&[u8]>,
    coeff: f32,
) -> Result<Tensor<Box<[u8]>>> {
    RawScoreCfg::new(heads).backward(output_grads, inputs, coeff)
}

/// 从主机数据构造连续的半精度张量，维数不限
pub fn tensor_from_f16<const N: usize>(
    shape: [usize; N],
    data: &[f16],
) -> Result<Tensor<Box<[u8]>>> {
    let len = shape.iter().product::<usize>();
    if len != data.len() {
        return Err(Error::shape(
            "data",
            format!("shape {shape:?} needs {len} elements, got {}", data.len()),
        ));
    }
    Ok(Tensor::from_dim_slice(types::F16, shape).map(|_| to_bytes(data.iter().copied())))
}

/// 按行主序读出任意维数、任意步长的半精度张量
pub fn tensor_to_f16(tensor: Tensor<&[u8]>) -> Result<Vec<f16>> {
    check_dtype("tensor", &tensor)?;

    let shape = tensor.shape().to_vec();
    let strides = tensor.strides().to_vec();
    let offset = tensor.offset() as isize;
    let data = tensor.take();

    let len = shape.iter().product::<usize>();
    let mut ans = Vec::with_capacity(len);
    let mut idx = vec![0usize; shape.len()];
    for _ in 0..len {
        let p = offset
            + zip(&idx, &strides)
                .map(|(&i, &s)| i as isize * s)
                .sum::<isize>();
        let p = usize::try_from(p)
            .ok()
            .filter(|&p| p + 1 < data.len())
            .ok_or_else(|| Error::shape("tensor", format!("byte offset {p} out of bounds")))?;
        ans.push(f16::from_ne_bytes([data[p], data[p + 1]]));
        // 行主序进位
        for (i, &d) in zip(&mut idx, &shape).rev() {
            *i += 1;
            if *i < d {
                break;
            }
            *i = 0
        }
    }
    Ok(ans)
}

fn check_rank<T>(arg: &'static str, tensor: &Tensor<T>) -> Result<()> {
    match tensor.shape().len() {
        3 => Ok(()),
        ndim => Err(Error::NotThreeDimensional { arg, ndim }),
    }
}

fn check_dtype<T>(arg: &'static str, tensor: &Tensor<T>) -> Result<()> {
    let dt = tensor.dt();
    if dt == types::F16 {
        Ok(())
    } else {
        Err(Error::UnsupportedDType { arg, dt })
    }
}
