//! Minimal Burn EGAT smoke example.
//!
//! Run:
//!   cargo run -p egat --example burn_egat_smoke --features backend-burn

#[cfg(not(feature = "backend-burn"))]
fn main() {
    eprintln!("This example requires `--features backend-burn`.");
}

#[cfg(feature = "backend-burn")]
fn main() {
    use burn::tensor::backend::Backend;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use egat::burn_egat::{BurnAttentionDims, BurnEdgeAttention};

    type B = NdArray<f32>;

    let device = <B as Backend>::Device::default();

    let kernel = BurnEdgeAttention::<B>::from_flat(
        &[1.0, 0.0, 0.0, 1.0],
        &[0.5, -0.5, 1.0, 0.25],
        None,
        BurnAttentionDims {
            in_channels: 2,
            out_channels: 2,
            slices: 1,
            concat: true,
            negative_slope: 0.2,
        },
        &device,
    );

    let x = burn::tensor::Tensor::<B, 2>::from_data(
        TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0], [3, 2]),
        &device,
    );
    let rows = [0u32, 1, 2, 0, 1, 2];
    let cols = [1u32, 2, 0, 0, 1, 2];
    let gate = burn::tensor::Tensor::<B, 2>::from_data(
        TensorData::new(vec![2.0f32, 0.5, 1.0, 1.0, 1.0, 1.0], [6, 1]),
        &device,
    );

    let (out, alpha) = kernel.edge_gated(x, &rows, &cols, gate);
    println!("alpha: {:?}", alpha.to_data().to_vec::<f32>().unwrap());
    println!("out:   {:?}", out.to_data().to_vec::<f32>().unwrap());
}
