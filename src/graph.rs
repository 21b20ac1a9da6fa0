//! Graph containers and edge-list transforms.
//!
//! Edge indices are `(2, E)` `u32` tensors. Row 0 is the target of a message (the node whose
//! output is being aggregated), row 1 is the node the message comes from.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// One graph for a single forward pass.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Node features, `(N, F)`.
    pub x: Tensor,
    /// Connectivity, `(2, E)` `u32`.
    pub edge_index: Tensor,
    /// Edge attributes, `(E,)` or `(E, D)`.
    pub edge_attr: Tensor,
}

impl Graph {
    /// Builds a graph after checking that every edge endpoint is a valid node and that the
    /// attributes line up with the edges.
    ///
    /// A 1-D `x` is read as `N` nodes with one feature each. `i64` edge indices are accepted
    /// and converted.
    pub fn new(x: Tensor, edge_index: Tensor, edge_attr: Tensor) -> Result<Self> {
        let x = node_matrix(&x)?;
        let num_nodes = x.dim(0)?;
        let edge_index = checked_edge_index(&edge_index, num_nodes)?;
        check_edge_attr(&edge_attr, edge_index.dim(1)?)?;
        Ok(Self {
            x,
            edge_index,
            edge_attr,
        })
    }

    /// Builds a graph from `(target, source)` pairs.
    pub fn from_edges(x: Tensor, edges: &[(u32, u32)], edge_attr: Tensor) -> Result<Self> {
        let (rows, cols): (Vec<u32>, Vec<u32>) = edges.iter().copied().unzip();
        let edge_index = edge_index_from_rows(&rows, &cols, x.device())?;
        Self::new(x, edge_index, edge_attr)
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.x.dims()[0]
    }

    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.edge_index.dims()[1]
    }
}

/// `B` equally sized graphs merged into one disconnected graph.
///
/// Node `i` of the merged graph belongs to graph `i / nodes_per_graph`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub graph: Graph,
    num_graphs: usize,
}

impl Batch {
    /// Concatenates graphs, offsetting each graph's edge indices by the nodes before it.
    pub fn from_graphs(graphs: &[Graph]) -> Result<Self> {
        let Some(first) = graphs.first() else {
            return Err(Error::InvalidConfig("a batch needs at least one graph".into()));
        };
        let n = first.num_nodes();
        let device = first.x.device();

        let mut rows = Vec::new();
        let mut cols = Vec::new();
        for (g, graph) in graphs.iter().enumerate() {
            if graph.num_nodes() != n {
                return Err(Error::shape("batch node count", n, graph.num_nodes()));
            }
            let offset = (g * n) as u32;
            let (r, c) = edge_rows(&graph.edge_index)?;
            rows.extend(r.into_iter().map(|i| i + offset));
            cols.extend(c.into_iter().map(|i| i + offset));
        }

        let xs: Vec<&Tensor> = graphs.iter().map(|g| &g.x).collect();
        let attrs: Vec<&Tensor> = graphs.iter().map(|g| &g.edge_attr).collect();
        let graph = Graph {
            x: Tensor::cat(&xs, 0)?,
            edge_index: edge_index_from_rows(&rows, &cols, device)?,
            edge_attr: Tensor::cat(&attrs, 0)?,
        };
        Ok(Self {
            graph,
            num_graphs: graphs.len(),
        })
    }

    /// Wraps an already merged graph holding `num_graphs` graphs of equal size.
    pub fn from_merged(graph: Graph, num_graphs: usize) -> Result<Self> {
        check_batch_divides(graph.num_nodes(), num_graphs)?;
        Ok(Self { graph, num_graphs })
    }

    #[must_use]
    pub fn num_graphs(&self) -> usize {
        self.num_graphs
    }

    #[must_use]
    pub fn nodes_per_graph(&self) -> usize {
        self.graph.num_nodes() / self.num_graphs
    }

    /// Graph that merged node `node` came from.
    #[must_use]
    pub fn graph_of(&self, node: usize) -> usize {
        node / self.nodes_per_graph()
    }
}

pub(crate) fn check_batch_divides(num_nodes: usize, num_graphs: usize) -> Result<()> {
    if num_graphs == 0 || num_nodes % num_graphs != 0 {
        return Err(Error::shape(
            "nodes per graph",
            format!("a multiple of {num_graphs}"),
            num_nodes,
        ));
    }
    Ok(())
}

/// Drops every edge whose endpoints coincide, along with its attribute row.
///
/// Accepts a `u32` or `i64` edge index; the returned index is `u32`.
pub fn remove_self_loops(edge_index: &Tensor, edge_attr: &Tensor) -> Result<(Tensor, Tensor)> {
    let edge_index = &checked_edge_index(edge_index, u32::MAX as usize + 1)?;
    let (rows, cols) = edge_rows(edge_index)?;
    let keep: Vec<u32> = (0..rows.len())
        .filter(|&e| rows[e] != cols[e])
        .map(|e| e as u32)
        .collect();
    if keep.len() == rows.len() {
        return Ok((edge_index.clone(), edge_attr.clone()));
    }

    let (kept_rows, kept_cols): (Vec<u32>, Vec<u32>) = keep
        .iter()
        .map(|&e| (rows[e as usize], cols[e as usize]))
        .unzip();
    let device = edge_index.device();
    let edge_index = edge_index_from_rows(&kept_rows, &kept_cols, device)?;
    let edge_attr = if keep.is_empty() {
        edge_attr.narrow(0, 0, 0)?
    } else {
        let keep = Tensor::from_vec(keep.clone(), keep.len(), device)?;
        edge_attr.index_select(&keep, 0)?
    };
    Ok((edge_index, edge_attr))
}

/// Replaces all existing self-loops with exactly one loop per node.
///
/// The loops `(i, i)` for `i in 0..num_nodes` are appended after the surviving edges, and
/// their attributes are `fill` broadcast to the attribute's trailing shape.
///
/// Indices outside `[0, num_nodes)` are rejected with [`Error::InvalidIndex`].
pub fn add_self_loops(
    edge_index: &Tensor,
    edge_attr: &Tensor,
    num_nodes: usize,
    fill: f64,
) -> Result<(Tensor, Tensor)> {
    let edge_index = checked_edge_index(edge_index, num_nodes)?;
    let (edge_index, edge_attr) = remove_self_loops(&edge_index, edge_attr)?;
    let (mut rows, mut cols) = edge_rows(&edge_index)?;
    rows.extend(0..num_nodes as u32);
    cols.extend(0..num_nodes as u32);
    let edge_index = edge_index_from_rows(&rows, &cols, edge_attr.device())?;

    let mut loop_shape = edge_attr.dims().to_vec();
    loop_shape[0] = num_nodes;
    let loop_attr =
        Tensor::ones(loop_shape, edge_attr.dtype(), edge_attr.device())?.affine(fill, 0.0)?;
    let edge_attr = if edge_attr.dim(0)? == 0 {
        loop_attr
    } else {
        Tensor::cat(&[&edge_attr, &loop_attr], 0)?
    };
    Ok((edge_index, edge_attr))
}

/// Reads a `(2, E)` `u32` edge index back to the host as `(rows, cols)`.
pub(crate) fn edge_rows(edge_index: &Tensor) -> Result<(Vec<u32>, Vec<u32>)> {
    let dims = edge_index.dims();
    if dims.len() != 2 || dims[0] != 2 {
        return Err(Error::shape("edge index", "(2, E)", dims));
    }
    let mut rows = edge_index.flatten_all()?.to_vec1::<u32>()?;
    let cols = rows.split_off(dims[1]);
    Ok((rows, cols))
}

pub(crate) fn edge_index_from_rows(rows: &[u32], cols: &[u32], device: &Device) -> Result<Tensor> {
    let num_edges = rows.len();
    let flat = [rows, cols].concat();
    Ok(Tensor::from_vec(flat, (2, num_edges), device)?)
}

pub(crate) fn node_matrix(x: &Tensor) -> Result<Tensor> {
    match x.rank() {
        1 => Ok(x.unsqueeze(1)?),
        2 => Ok(x.clone()),
        _ => Err(Error::shape("node features", "(N, F)", x.dims())),
    }
}

/// Validates `edge_index` against `num_nodes` and returns it as `u32`.
pub(crate) fn checked_edge_index(edge_index: &Tensor, num_nodes: usize) -> Result<Tensor> {
    let dims = edge_index.dims();
    if dims.len() != 2 || dims[0] != 2 {
        return Err(Error::shape("edge index", "(2, E)", dims));
    }
    let values: Vec<i64> = match edge_index.dtype() {
        DType::U32 => edge_index
            .flatten_all()?
            .to_vec1::<u32>()?
            .into_iter()
            .map(i64::from)
            .collect(),
        DType::I64 => edge_index.flatten_all()?.to_vec1::<i64>()?,
        other => return Err(Error::shape("edge index dtype", "u32 or i64", other)),
    };
    if let Some(&index) = values
        .iter()
        .find(|&&i| i < 0 || i >= num_nodes as i64)
    {
        return Err(Error::InvalidIndex { index, num_nodes });
    }
    if edge_index.dtype() == DType::U32 {
        return Ok(edge_index.clone());
    }
    let as_u32: Vec<u32> = values.into_iter().map(|i| i as u32).collect();
    Ok(Tensor::from_vec(as_u32, dims, edge_index.device())?)
}

pub(crate) fn check_edge_attr(edge_attr: &Tensor, num_edges: usize) -> Result<()> {
    let dims = edge_attr.dims();
    if dims.is_empty() || dims.len() > 2 || dims[0] != num_edges {
        return Err(Error::shape(
            "edge attributes",
            format!("({num_edges},) or ({num_edges}, D)"),
            dims,
        ));
    }
    Ok(())
}
