//! Global-descriptor retrieval.

use feature_store::GlobalDescriptorIndex;

/// Cosine similarity of the query against every index row, returning the
/// top-k (index, score) pairs. Index rows are unit norm; the query is
/// normalized here. Equal similarities break toward the smaller row index,
/// making retrieval a pure function of its inputs.
pub fn retrieve_top_k(
    index: &GlobalDescriptorIndex,
    query: &[f32],
    k: usize,
) -> Vec<(usize, f32)> {
    if k == 0 || index.is_empty() || query.len() != index.matrix.ncols() {
        return Vec::new();
    }
    let norm: f32 = query.iter().map(|v| v * v).sum::<f32>().sqrt();
    let inv = if norm > 0.0 { 1.0 / norm } else { 0.0 };

    let mut scored: Vec<(usize, f32)> = (0..index.matrix.nrows())
        .map(|row| {
            let score: f32 = (0..query.len())
                .map(|col| index.matrix[(row, col)] * query[col] * inv)
                .sum();
            (row, score)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored
}
