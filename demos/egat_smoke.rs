//! Minimal EGAT smoke example (Candle backend).
//!
//! Run:
//!   cargo run -p egat --example egat_smoke

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use egat::{EGATConv, EdgeConv, EgatConfig, Graph, MemoryCollector, Stage};

fn main() -> egat::Result<()> {
    let dev = &Device::Cpu;

    let n = 6usize;
    let d = 4usize;

    let x = Tensor::randn(0f32, 1.0, (n, d), dev)?;
    let edges: Vec<(u32, u32)> = (0..n as u32).map(|i| (i, (i + 1) % n as u32)).collect();
    let weights = Tensor::rand(0.5f32, 1.5, edges.len(), dev)?;
    let graph = Graph::from_edges(x, &edges, weights)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let layer = EGATConv::new(EgatConfig::new(d, 3).with_heads(2), vb)?;
    println!("{layer}");

    let res = layer.forward_single(&graph, false)?;
    let (yn, yd) = res.out.dims2()?;
    println!("out shape: [{yn}, {yd}]");
    println!("edges after self-loops: {}", res.edge_index.dim(1)?);

    let mut diag = MemoryCollector::new();
    layer.forward_with(
        &graph.x,
        &graph.edge_index,
        &graph.edge_attr,
        false,
        Some(&mut diag),
    )?;
    println!("recorded logits: {:?}", diag.get(Stage::Logits)[0].dims());

    Ok(())
}
