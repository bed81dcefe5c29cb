//! Which phase a forward pass runs in.

use candle_core::Tensor;

/// A forward call on the whole stack.
#[derive(Debug, Clone)]
pub enum Step {
    /// Full prompt `[batch, seq, hidden]` with a `(batch, seq)` validity mask;
    /// non-zero entries are real tokens.
    Prefill { input_mask: Tensor },
    /// One token per batch row. `batch_valid_length[b]` is the number of
    /// valid tokens already cached for row `b`, padding excluded. The new
    /// token lands right after them, past any left padding of the prompt.
    /// Required in explicit position mode, ignored in inferred mode.
    Decode {
        batch_valid_length: Option<Vec<usize>>,
    },
}

impl Step {
    pub fn is_prefill(&self) -> bool {
        matches!(self, Step::Prefill { .. })
    }
}

/// Per-layer view of a [`Step`], with the prompt mask already built.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LayerStep<'a> {
    Prefill {
        /// `(batch, seq)`, binarised.
        validity: &'a Tensor,
        /// `(batch, seq, seq)` causal mask.
        mask: &'a Tensor,
    },
    Decode {
        batch_valid_length: Option<&'a [usize]>,
    },
}
