//! Model inputs derived from a batch of token ids.
//!
//! Training packs several documents into one sequence, separated by an end-of-document (EOD)
//! token. [`get_ltor_masks_and_position_ids`] builds the left-to-right attention mask, the loss
//! mask and the position ids for such a batch, optionally treating each document as an
//! independent sequence.

use crate::tensor::{Result, Tensor, TensorElem};

/// Masks and positions for a `[batch, seq]` batch of tokens.
#[derive(Debug, Clone)]
pub struct LtorInputs<T: TensorElem> {
    /// `[1, s, s]`, or `[b, s, s]` when attention is reset at EOD. 1 = visible.
    pub attention_mask: Tensor<T, 3>,
    /// `[b, s]`. 0 at EOD tokens when they are excluded from the loss.
    pub loss_mask: Tensor<T, 2>,
    /// `[b, s]`.
    pub position_ids: Tensor<usize, 2>,
}

/// Builds the causal attention mask, loss mask and position ids for `tokens`.
///
/// * `reset_position_ids`: positions restart at 0 after every EOD.
/// * `reset_attention_mask`: tokens after an EOD cannot attend to tokens up to and including it.
/// * `eod_mask_loss`: EOD positions get a loss weight of 0.
pub fn get_ltor_masks_and_position_ids<T: TensorElem>(
    tokens: &Tensor<usize, 2>,
    eod_token: usize,
    reset_position_ids: bool,
    reset_attention_mask: bool,
    eod_mask_loss: bool,
) -> Result<LtorInputs<T>> {
    let [batch, seq] = *tokens.shape();
    let mask_batch = if reset_attention_mask { batch } else { 1 };

    let mut attention_mask = Tensor::from_fn([mask_batch, seq, seq], |i| {
        let (row, col) = ((i / seq) % seq, i % seq);
        if col <= row { T::one() } else { T::zero() }
    });

    let loss_mask = Tensor::from_fn([batch, seq], |i| {
        if eod_mask_loss && tokens.data()[i] == eod_token {
            T::zero()
        } else {
            T::one()
        }
    });

    let mut position_ids = Tensor::from_fn([batch, seq], |i| i % seq);

    if reset_position_ids || reset_attention_mask {
        for b in 0..batch {
            let row = &tokens.data()[b * seq..(b + 1) * seq];
            let mut prev = 0;
            for i in row
                .iter()
                .enumerate()
                .filter(|(_, t)| **t == eod_token)
                .map(|(i, _)| i)
            {
                if reset_attention_mask {
                    // Rows after the EOD lose sight of columns up to and including it.
                    let plane = &mut attention_mask.data_mut()[b * seq * seq..(b + 1) * seq * seq];
                    for r in i + 1..seq {
                        plane[r * seq..r * seq + i + 1].fill(T::zero());
                    }
                }
                if reset_position_ids {
                    let pos = &mut position_ids.data_mut()[b * seq..(b + 1) * seq];
                    for p in &mut pos[i + 1..] {
                        *p -= i + 1 - prev;
                    }
                    prev = i + 1;
                }
            }
        }
    }

    Ok(LtorInputs {
        attention_mask,
        loss_mask,
        position_ids,
    })
}
