//! In-memory HNSW graph over one scope's vectors.
//!
//! Built from the rows of a scope table once that scope has an index, and
//! thrown away whenever the table changes. The graph only proposes
//! candidates; callers rescore them exactly against the stored vectors.

use hnsw_rs::hnsw::{Hnsw, Neighbour};
use hnsw_rs::prelude::*;

use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::DistanceMetric;
use convo_rag_core::vector::normalize;

const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;

enum Graph {
    /// Used for both cosine and dot metrics; vectors are normalized first.
    Cosine(Hnsw<'static, f32, DistCosine>),
    L2(Hnsw<'static, f32, DistL2>),
}

pub struct AnnIndex {
    graph: Graph,
    /// Row ids in insertion order; HNSW data ids index into this.
    ids: Vec<String>,
    dimensions: usize,
}

impl AnnIndex {
    /// Build a graph from `(id, vector)` rows. CPU-bound: run it on a
    /// blocking thread.
    pub fn build(
        metric: DistanceMetric,
        dimensions: usize,
        rows: Vec<(String, Vec<f32>)>,
    ) -> Result<Self> {
        for (id, v) in &rows {
            if v.len() != dimensions {
                return Err(RagError::Store(format!(
                    "row '{}' has {} dimensions, index expects {}",
                    id,
                    v.len(),
                    dimensions
                )));
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(RagError::Store(format!(
                    "row '{}' contains NaN or Infinity",
                    id
                )));
            }
        }

        let max_elements = rows.len().max(1);
        let mut ids = Vec::with_capacity(rows.len());

        let graph = match metric {
            DistanceMetric::Cosine | DistanceMetric::Dot => {
                let mut hnsw: Hnsw<f32, DistCosine> = Hnsw::new(
                    MAX_NB_CONNECTION,
                    max_elements,
                    MAX_LAYER,
                    EF_CONSTRUCTION,
                    DistCosine,
                );
                for (data_id, (id, v)) in rows.into_iter().enumerate() {
                    let normalized = normalize(&v);
                    hnsw.insert((normalized.as_slice(), data_id));
                    ids.push(id);
                }
                hnsw.set_searching_mode(true);
                Graph::Cosine(hnsw)
            }
            DistanceMetric::L2 => {
                let mut hnsw: Hnsw<f32, DistL2> = Hnsw::new(
                    MAX_NB_CONNECTION,
                    max_elements,
                    MAX_LAYER,
                    EF_CONSTRUCTION,
                    DistL2,
                );
                for (data_id, (id, v)) in rows.into_iter().enumerate() {
                    hnsw.insert((v.as_slice(), data_id));
                    ids.push(id);
                }
                hnsw.set_searching_mode(true);
                Graph::L2(hnsw)
            }
        };

        Ok(Self {
            graph,
            ids,
            dimensions,
        })
    }

    /// Ids of up to `k` approximate nearest rows.
    pub fn candidates(&self, query: &[f32], k: usize) -> Result<Vec<String>> {
        if query.len() != self.dimensions {
            return Err(RagError::InvalidInput(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimensions
            )));
        }
        if self.ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let ef_search = (k * 2).max(64);
        let neighbours: Vec<Neighbour> = match &self.graph {
            Graph::Cosine(hnsw) => hnsw.search(&normalize(query), k, ef_search),
            Graph::L2(hnsw) => hnsw.search(query, k, ef_search),
        };

        Ok(neighbours
            .into_iter()
            .filter_map(|n| self.ids.get(n.d_id).cloned())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
