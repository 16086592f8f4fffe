//! The one place native line and column numbers are converted to and from the
//! 1-based model.

/// Numbering a wire protocol uses for lines and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineBase {
    ZeroBased,
    OneBased,
}

impl LineBase {
    /// Native value to the 1-based model. Never returns 0.
    pub fn to_model(self, native: i64) -> u32 {
        let model = match self {
            LineBase::ZeroBased => native.saturating_add(1),
            LineBase::OneBased => native,
        };
        model.clamp(1, u32::MAX as i64) as u32
    }

    /// 1-based model value to native numbering.
    pub fn to_native(self, model: u32) -> u32 {
        match self {
            LineBase::ZeroBased => model.saturating_sub(1),
            LineBase::OneBased => model.max(1),
        }
    }
}
