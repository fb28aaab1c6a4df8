use any_tensor::digit_layout::DigitLayout;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 张量不是 3 维
    #[error("expected 3D tensor for `{arg}`, got {ndim}D")]
    NotThreeDimensional { arg: &'static str, ndim: usize },

    /// 张量不是半精度
    #[error("only HALF is supported, `{arg}` is {dt:?}")]
    UnsupportedDType { arg: &'static str, dt: DigitLayout },

    #[error("shape mismatch for `{arg}`: {reason}")]
    ShapeMismatch { arg: &'static str, reason: String },
}

impl Error {
    /// rank 或数据类型不满足要求，调用方用法错误
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Self::NotThreeDimensional { .. } | Self::UnsupportedDType { .. }
        )
    }

    pub(crate) fn shape(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            arg,
            reason: reason.into(),
        }
    }
}
