//! Embed a small molecule and round-trip the network through a checkpoint
//!
//! Demonstrates: build graph → batch → forward → save with metadata →
//! reload from checkpoint → identical embedding
//!
//! Run with:
//! ```bash
//! cargo run --example embed_molecule
//! ```

use molkgnn::prelude::*;

/// One-hot over {C, O} plus three formal-charge/aromatic style slots.
fn atom(one_hot: usize) -> Vec<f32> {
    let mut features = vec![0.0; 5];
    features[one_hot] = 1.0;
    features
}

fn ethanol() -> Result<MolecularGraph> {
    // Heavy atoms only: C-C-O
    MolecularGraph::new(
        vec![atom(0), atom(0), atom(1)],
        vec![[0.0, 0.0, 0.0], [1.52, 0.0, 0.0], [2.02, 1.35, 0.0]],
    )?
    .with_bond(0, 1, vec![1.0])?
    .with_bond(1, 2, vec![1.0])
    .map(|g| g.with_smiles("CCO"))
}

fn main() -> Result<()> {
    let device = cpu_device();

    // 1. Network
    let config = KgnnConfig::default()
        .with_layers(2)
        .with_feature_dims(5, 1)
        .with_embedding_dim(8);
    let net = MolKgnnNet::new(config, &device)?;
    println!("Network with {} parameters", net.num_parameters());

    // 2. Embed
    let batch = MolecularBatch::from_graphs(&[ethanol()?], &device)?;
    let output = net.forward(&batch)?;
    println!("Node representation: {:?}", output.node_representation.dims());
    println!("Graph embedding:     {:?}", output.graph_embedding.dims());

    // 3. Save
    let dir = std::env::temp_dir().join("molkgnn_embed_molecule");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("ethanol.safetensors");
    let meta = net.save_with_metadata(&path, "ethanol-demo")?;
    println!("Saved {} ({}, {} params)", path.display(), meta.config_fingerprint, meta.param_count);

    for info in inspect_checkpoint(&path)?.iter().take(5) {
        println!("  {:<40} {:?}", info.name, info.shape);
    }

    // 4. Reload and compare
    let restored = MolKgnnNet::from_checkpoint(&path, &device)?;
    let again = restored.forward(&batch)?;
    let a = output.graph_embedding.to_vec2::<f32>()?;
    let b = again.graph_embedding.to_vec2::<f32>()?;
    println!("Reloaded embedding matches: {}", a == b);

    // 5. Embedding bundle for downstream use
    let (tensor_path, smiles_path) = save_graph_embedding(&dir, &output.graph_embedding, &batch.smiles)?;
    println!("Wrote {} and {}", tensor_path.display(), smiles_path.display());

    Ok(())
}
