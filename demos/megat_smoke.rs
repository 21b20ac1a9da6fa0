//! Minimal MEGAT smoke example (Candle backend).
//!
//! Run:
//!   cargo run -p egat --example megat_smoke

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use egat::{Batch, EdgeConv, Graph, MEGATConv, MegatConfig};

fn main() -> egat::Result<()> {
    let dev = &Device::Cpu;

    let n = 5usize;
    let d = 4usize;
    let attr_dim = 3usize;
    let edges = [(0u32, 1u32), (0, 2), (1, 3), (3, 4), (4, 0)];

    let graphs = (0..2)
        .map(|_| {
            let x = Tensor::randn(0f32, 1.0, (n, d), dev)?;
            let attr = Tensor::rand(0f32, 1.0, (edges.len(), attr_dim), dev)?;
            Graph::from_edges(x, &edges, attr)
        })
        .collect::<egat::Result<Vec<_>>>()?;
    let batch = Batch::from_graphs(&graphs)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let layer = MEGATConv::new(MegatConfig::new(d, 2, attr_dim), vb)?;
    println!("{layer}");

    let res = layer.forward_batch(&batch, false)?;
    let (yn, yd) = res.out.dims2()?;
    println!("out shape: [{yn}, {yd}] over {} graphs", batch.num_graphs());

    let alpha = res.alpha.sum(1)?.to_vec1::<f32>()?;
    println!("per-edge alpha summed across attribute dims: {alpha:?}");

    Ok(())
}
