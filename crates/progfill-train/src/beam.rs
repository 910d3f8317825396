//! Length-penalized beam search over an incremental decode function.
//!
//! The model side is a closure: given the flat `[batch * beam]` token tensor
//! for this step (and the flat parent indices to re-parent its cache by), it
//! returns next-token logits. Ranking, the finished pool and early stopping
//! all run on the host in f64.

use candle_core::{Device, Tensor};
use progfill_core::Result;

const NEG_INF: f64 = -1.0e9;

#[derive(Debug, Clone)]
pub struct BeamSearchParams {
    pub beam_size: usize,
    /// Brevity penalty exponent; 0 disables length normalization.
    pub alpha: f64,
    pub bos: u32,
    pub eos: u32,
    pub max_decode_len: usize,
}

#[derive(Debug, Clone)]
pub struct Hypothesis {
    /// Generated tokens, EOS included when the hypothesis finished.
    pub tokens: Vec<u32>,
    pub log_prob: f64,
    /// Log-probability divided by the brevity penalty.
    pub score: f64,
}

/// `((5 + len) / 6)^alpha`, the standard brevity penalty.
fn brevity_penalty(alpha: f64, length: usize) -> f64 {
    ((5.0 + length as f64) / 6.0).powf(alpha)
}

/// Tile each batch row `beam` times along a new flat leading dimension:
/// `[b, ...] -> [b * beam, ...]` with row `i` repeated contiguously.
pub fn flat_batch_beam_expand(t: &Tensor, beam: usize) -> Result<Tensor> {
    let mut dims = t.dims().to_vec();
    let b = dims[0];
    let mut tiled = dims.clone();
    tiled.insert(1, beam);
    dims[0] = b * beam;
    Ok(t.unsqueeze(1)?.broadcast_as(tiled)?.contiguous()?.reshape(dims)?)
}

#[derive(Debug, Clone)]
struct LiveSlot {
    tokens: Vec<u32>,
    log_prob: f64,
    /// Flat parent index from the previous step's expansion.
    parent: u32,
}

/// Run beam search for `batch` elements.
///
/// `step_fn(tokens, parents)` must first re-parent its decode cache by
/// `parents` (when given), then consume `tokens` (`[batch * beam]`, U32) and
/// return logits `[batch * beam, vocab]`.
///
/// Returns `beam_size` hypotheses per element in ascending score order, so
/// the best candidate is last.
pub fn beam_search<F>(
    batch: usize,
    params: &BeamSearchParams,
    device: &Device,
    mut step_fn: F,
) -> Result<Vec<Vec<Hypothesis>>>
where
    F: FnMut(&Tensor, Option<&Tensor>) -> Result<Tensor>,
{
    let beam = params.beam_size;
    let max_len = params.max_decode_len;

    // Slot 0 carries the real start state; duplicates are pushed out of
    // contention with a large negative initial log-probability.
    let mut live: Vec<Vec<LiveSlot>> = (0..batch)
        .map(|b| {
            (0..beam)
                .map(|s| LiveSlot {
                    tokens: Vec::new(),
                    log_prob: if s == 0 { 0.0 } else { NEG_INF },
                    parent: (b * beam + s) as u32,
                })
                .collect()
        })
        .collect();
    let mut finished: Vec<Vec<Hypothesis>> = vec![Vec::new(); batch];
    let mut parents: Option<Tensor> = None;

    for _step in 0..max_len {
        let tokens: Vec<u32> = live
            .iter()
            .flat_map(|slots| {
                slots
                    .iter()
                    .map(|s| s.tokens.last().copied().unwrap_or(params.bos))
            })
            .collect();
        let tokens = Tensor::new(tokens.as_slice(), device)?;
        let logits = step_fn(&tokens, parents.as_ref())?;
        let log_probs = host_log_softmax(&logits)?;

        let mut next_parents = Vec::with_capacity(batch * beam);
        for b in 0..batch {
            let mut candidates: Vec<(usize, u32, f64)> = Vec::with_capacity(beam * 2 * beam);
            for (slot_idx, slot) in live[b].iter().enumerate() {
                let row = &log_probs[b * beam + slot_idx];
                // 2 * beam per slot covers every way the next frontier
                // could be filled from this parent.
                for (token, lp) in top_k(row, 2 * beam) {
                    let total = slot.log_prob + lp;
                    // Sentinel parents and impossible tokens are not real
                    // continuations and must never reach the finished pool.
                    if total <= NEG_INF / 2.0 {
                        continue;
                    }
                    candidates.push((slot_idx, token, total));
                }
            }
            candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

            let mut next: Vec<LiveSlot> = Vec::with_capacity(beam);
            for (slot_idx, token, lp) in candidates {
                if token == params.eos {
                    let mut tokens = live[b][slot_idx].tokens.clone();
                    tokens.push(params.eos);
                    let score = lp / brevity_penalty(params.alpha, tokens.len());
                    insert_finished(&mut finished[b], Hypothesis {
                        tokens,
                        log_prob: lp,
                        score,
                    }, beam);
                } else if next.len() < beam {
                    let mut tokens = live[b][slot_idx].tokens.clone();
                    tokens.push(token);
                    next.push(LiveSlot {
                        tokens,
                        log_prob: lp,
                        parent: (b * beam + slot_idx) as u32,
                    });
                }
                if next.len() == beam && finished[b].len() >= beam {
                    break;
                }
            }
            while next.len() < beam {
                // Degenerate vocab; park a dead slot.
                next.push(LiveSlot {
                    tokens: vec![params.eos],
                    log_prob: NEG_INF,
                    parent: (b * beam) as u32,
                });
            }
            next_parents.extend(next.iter().map(|s| s.parent));
            live[b] = next;
        }
        parents = Some(Tensor::new(next_parents.as_slice(), device)?);

        if search_is_done(&live, &finished, params) {
            break;
        }
    }

    Ok(finalize(live, finished, params))
}

/// True once no live hypothesis can still beat the worst kept finished one.
fn search_is_done(
    live: &[Vec<LiveSlot>],
    finished: &[Vec<Hypothesis>],
    params: &BeamSearchParams,
) -> bool {
    let best_possible = brevity_penalty(params.alpha, params.max_decode_len);
    live.iter().zip(finished).all(|(slots, pool)| {
        if pool.len() < params.beam_size {
            return false;
        }
        let worst_kept = pool
            .iter()
            .map(|h| h.score)
            .fold(f64::INFINITY, f64::min);
        let best_live = slots
            .iter()
            .map(|s| s.log_prob)
            .fold(f64::NEG_INFINITY, f64::max);
        best_live / best_possible <= worst_kept
    })
}

fn finalize(
    live: Vec<Vec<LiveSlot>>,
    finished: Vec<Vec<Hypothesis>>,
    params: &BeamSearchParams,
) -> Vec<Vec<Hypothesis>> {
    live.into_iter()
        .zip(finished)
        .map(|(slots, mut pool)| {
            // Truncated live hypotheses fill any shortfall.
            if pool.len() < params.beam_size {
                let mut overflow: Vec<Hypothesis> = slots
                    .into_iter()
                    .map(|s| {
                        let score =
                            s.log_prob / brevity_penalty(params.alpha, s.tokens.len().max(1));
                        Hypothesis {
                            tokens: s.tokens,
                            log_prob: s.log_prob,
                            score,
                        }
                    })
                    .collect();
                overflow.sort_by(|a, b| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                });
                for h in overflow {
                    if pool.len() == params.beam_size {
                        break;
                    }
                    pool.push(h);
                }
            }
            pool.sort_by(|a, b| {
                a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal)
            });
            pool
        })
        .collect()
}

fn insert_finished(pool: &mut Vec<Hypothesis>, h: Hypothesis, beam: usize) {
    pool.push(h);
    if pool.len() > beam {
        pool.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        });
        pool.truncate(beam);
    }
}

fn top_k(row: &[f64], k: usize) -> Vec<(u32, f64)> {
    let mut indexed: Vec<(u32, f64)> = row
        .iter()
        .enumerate()
        .map(|(i, &lp)| (i as u32, lp))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    indexed
}

fn host_log_softmax(logits: &Tensor) -> Result<Vec<Vec<f64>>> {
    let rows = logits.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max) as f64;
            let lse = row
                .iter()
                .map(|&x| ((x as f64) - max).exp())
                .sum::<f64>()
                .ln()
                + max;
            row.into_iter().map(|x| x as f64 - lse).collect()
        })
        .collect())
}
