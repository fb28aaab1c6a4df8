use super::kernel::{Acc, Geometry};
use half::f16;
use rayon::prelude::*;
use std::iter::zip;
use tracing::trace;

/// scores = coeff * q @ k^T，结果形状 \[batch * heads, seq, seq]
pub(super) fn forward<A: Acc>(geo: &Geometry, x: &[A], coeff: f32, tile_seq: usize) -> Vec<f16> {
    let &Geometry {
        batch, seq, heads, ..
    } = geo;
    let mut scores = vec![f16::ZERO; batch * heads * seq * seq];
    if scores.is_empty() {
        return scores;
    }

    let rows = batch * heads * seq;
    // tile 超过总行数没有意义，同时避免 tile_seq * seq 溢出
    let tile_seq = tile_seq.min(rows);
    trace!(rows, tiles = rows.div_ceil(tile_seq), "raw score forward");
    // 每个 tile 写 scores 中互不相交的 tile_seq 行，tile 之间可以任意并行
    scores
        .par_chunks_mut(tile_seq * seq)
        .enumerate()
        .for_each(|(tile, scores)| {
            ForwardTile {
                geo,
                x,
                scores,
                row0: tile * tile_seq,
                coeff: A::from_coeff(coeff),
            }
            .launch()
        });
    scores
}

/// dq = coeff * g @ k, dk = coeff * g^T @ q，结果为连续的 \[batch, seq, hidden]
pub(super) fn backward<A: Acc>(geo: &Geometry, g: &[A], x: &[A], coeff: f32) -> Vec<A> {
    let &Geometry {
        batch, seq, hidden, ..
    } = geo;
    let mut dx = vec![A::zero(); batch * seq * hidden];
    if dx.is_empty() {
        return dx;
    }

    trace!(units = batch, "raw score backward");
    // 每个 batch 元素的所有头写同一片互不相交的 dx
    dx.par_chunks_mut(seq * hidden)
        .enumerate()
        .for_each(|(b, dx)| {
            BackwardBatch {
                geo,
                b,
                g,
                x: &x[b * seq * hidden..][..seq * hidden],
                dx,
                coeff: A::from_coeff(coeff),
            }
            .launch()
        });
    dx
}

struct ForwardTile<'a, A> {
    geo: &'a Geometry,
    /// shape = {batch, seq, hidden}
    x: &'a [A],
    /// shape = {tile_seq, seq}，最后一个 tile 可能更短
    scores: &'a mut [f16],
    /// 第一行在 {batch * heads * seq} 中的序号
    row0: usize,
    coeff: A,
}

impl<A: Acc> ForwardTile<'_, A> {
    fn launch(self) {
        let Self {
            geo,
            x,
            scores,
            row0,
            coeff,
        } = self;
        let &Geometry {
            seq,
            hidden,
            heads,
            d,
            ..
        } = geo;

        for (r, scores) in scores.chunks_exact_mut(seq).enumerate() {
            let row = row0 + r;
            let (bh, iq) = (row / seq, row % seq);
            let (b, head) = (bh / heads, bh % heads);

            let x = &x[b * seq * hidden..][..seq * hidden];
            let q = &x[iq * hidden + geo.q_col(head)..][..d];
            let k_col = geo.k_col(head);
            for (ik, score) in scores.iter_mut().enumerate() {
                let k = &x[ik * hidden + k_col..][..d];
                *score = (zip(q, k).map(|(&q, &k)| q * k).sum::<A>() * coeff).to_half()
            }
        }
    }
}

struct BackwardBatch<'a, A> {
    geo: &'a Geometry,
    b: usize,
    /// shape = {batch * heads, seq, seq}
    g: &'a [A],
    /// shape = {seq, hidden}
    x: &'a [A],
    /// shape = {seq, hidden}
    dx: &'a mut [A],
    coeff: A,
}

impl<A: Acc> BackwardBatch<'_, A> {
    fn launch(self) {
        let Self {
            geo,
            b,
            g,
            x,
            dx,
            coeff,
        } = self;
        let &Geometry {
            seq,
            hidden,
            heads,
            d,
            ..
        } = geo;

        for head in 0..heads {
            let g = &g[(b * heads + head) * seq * seq..][..seq * seq];
            let q_col = geo.q_col(head);
            let k_col = geo.k_col(head);

            for iq in 0..seq {
                let q = &x[iq * hidden + q_col..][..d];
                for ik in 0..seq {
                    let k = &x[ik * hidden + k_col..][..d];
                    let gs = g[iq * seq + ik] * coeff;
                    // Shared 时 dq 与 dk 落在同一列，两部分在累加精度下求和
                    for (dq, &k) in zip(&mut dx[iq * hidden + q_col..][..d], k) {
                        *dq += gs * k
                    }
                    for (dk, &q) in zip(&mut dx[ik * hidden + k_col..][..d], q) {
                        *dk += gs * q
                    }
                }
            }
        }
    }
}
