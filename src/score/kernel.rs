use super::{AxisOrder, Operands, RawScoreCfg, Tensor};
use crate::{Error, Result};
use half::f16;
use num_traits::Float;
use std::{iter::Sum, ops::AddAssign};

/// 累加精度
pub(super) trait Acc: Float + Sum + AddAssign + From<f16> + Send + Sync {
    fn from_coeff(coeff: f32) -> Self;
    fn to_half(self) -> f16;
}

impl Acc for f32 {
    fn from_coeff(coeff: f32) -> Self {
        coeff
    }
    fn to_half(self) -> f16 {
        f16::from_f32(self)
    }
}

impl Acc for f64 {
    fn from_coeff(coeff: f32) -> Self {
        coeff as _
    }
    fn to_half(self) -> f16 {
        f16::from_f64(self)
    }
}

/// 一次调用的形状参数，前向和反向共用同一套头划分规则
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Geometry {
    pub batch: usize,
    pub seq: usize,
    pub hidden: usize,
    pub heads: usize,
    /// head dim
    pub d: usize,
    pub operands: Operands,
}

impl Geometry {
    /// 第 `head` 个头的 q 在 hidden 维上的起始列
    pub const fn q_col(&self, head: usize) -> usize {
        match self.operands {
            Operands::Shared => head * self.d,
            Operands::Interleaved => head * 2 * self.d,
        }
    }

    /// 第 `head` 个头的 k 在 hidden 维上的起始列
    pub const fn k_col(&self, head: usize) -> usize {
        match self.operands {
            Operands::Shared => head * self.d,
            Operands::Interleaved => head * 2 * self.d + self.d,
        }
    }

    /// \[batch * heads, seq, seq]
    pub const fn score_shape(&self) -> [usize; 3] {
        [self.batch * self.heads, self.seq, self.seq]
    }

    pub const fn input_shape(&self, axes: AxisOrder) -> [usize; 3] {
        let Self {
            batch, seq, hidden, ..
        } = *self;
        match axes {
            AxisOrder::BatchFirst => [batch, seq, hidden],
            AxisOrder::SeqFirst => [seq, batch, hidden],
        }
    }
}

impl RawScoreCfg {
    pub(super) fn geometry(&self, [batch, seq, hidden]: [usize; 3]) -> Result<Geometry> {
        let &Self {
            heads,
            operands,
            tile_seq,
            ..
        } = self;
        if tile_seq == 0 {
            return Err(Error::shape("tile_seq", "must be positive"));
        }
        Ok(Geometry {
            batch,
            seq,
            hidden,
            heads,
            d: self.head_dim(hidden)?,
            operands,
        })
    }
}

/// 已通过 rank 检查的 f16 张量，按字节步长访问
pub(super) struct View<'a> {
    data: &'a [u8],
    shape: [usize; 3],
    strides: [isize; 3],
    offset: isize,
}

impl<'a> View<'a> {
    pub fn new(arg: &'static str, tensor: Tensor<&'a [u8]>) -> Result<Self> {
        let &[d0, d1, d2] = tensor.shape() else {
            return Err(Error::NotThreeDimensional {
                arg,
                ndim: tensor.shape().len(),
            });
        };
        let &[s0, s1, s2] = tensor.strides() else {
            unreachable!()
        };
        let offset = tensor.offset() as isize;
        let data = tensor.take();

        let shape = [d0, d1, d2];
        let strides = [s0, s1, s2];
        // 所有元素都必须落在缓冲区内
        if shape.iter().all(|&d| d > 0) {
            let (mut lo, mut hi) = (offset, offset);
            for (&d, &s) in shape.iter().zip(&strides) {
                let span = (d - 1) as isize * s;
                if span < 0 {
                    lo += span
                } else {
                    hi += span
                }
            }
            if lo < 0 || hi + size_of::<f16>() as isize > data.len() as isize {
                return Err(Error::shape(
                    arg,
                    format!(
                        "layout reaches bytes {lo}..{} of a {}-byte buffer",
                        hi + 2,
                        data.len()
                    ),
                ));
            }
        }
        Ok(Self {
            data,
            shape,
            strides,
            offset,
        })
    }

    /// 逻辑形状 \[batch, seq, hidden]
    pub fn dims(&self, axes: AxisOrder) -> [usize; 3] {
        let [d0, d1, d2] = self.shape;
        match axes {
            AxisOrder::BatchFirst => [d0, d1, d2],
            AxisOrder::SeqFirst => [d1, d0, d2],
        }
    }

    /// 拷贝到连续的 \[batch, seq, hidden] 缓冲，同时提升到累加精度
    pub fn load<A: Acc>(&self, axes: AxisOrder) -> Vec<A> {
        let [s0, s1, s2] = self.strides;
        let [outer, inner, width] = self.dims(axes);
        let (so, si) = match axes {
            AxisOrder::BatchFirst => (s0, s1),
            AxisOrder::SeqFirst => (s1, s0),
        };

        let mut ans = Vec::with_capacity(outer * inner * width);
        for a in 0..outer {
            for b in 0..inner {
                let row = self.offset + a as isize * so + b as isize * si;
                for c in 0..width {
                    let p = (row + c as isize * s2) as usize;
                    let x = f16::from_ne_bytes([self.data[p], self.data[p + 1]]);
                    ans.push(<A as From<f16>>::from(x))
                }
            }
        }
        ans
    }
}

/// 将连续的 \[batch, seq, hidden] 结果写回输入的轴序，舍入到半精度
pub(super) fn store<A: Acc>(x: &[A], geo: &Geometry, axes: AxisOrder) -> Box<[u8]> {
    let &Geometry {
        batch, seq, hidden, ..
    } = geo;
    debug_assert_eq!(x.len(), batch * seq * hidden);

    match axes {
        AxisOrder::BatchFirst => to_bytes(x.iter().map(|&x| x.to_half())),
        AxisOrder::SeqFirst => to_bytes((0..seq).flat_map(|i| {
            (0..batch).flat_map(move |b| {
                x[(b * seq + i) * hidden..][..hidden]
                    .iter()
                    .map(|&x| x.to_half())
            })
        })),
    }
}

pub(super) fn to_bytes(data: impl IntoIterator<Item = f16>) -> Box<[u8]> {
    data.into_iter().flat_map(f16::to_ne_bytes).collect()
}
