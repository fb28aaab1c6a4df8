mod error;
mod score;

pub use error::{Error, Result};
pub use score::{
    Accumulate, AxisOrder, Operands, RawScoreCfg, Tensor, backward, forward, tensor_from_f16,
    tensor_to_f16,
};
