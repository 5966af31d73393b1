use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use futures::executor::block_on;
use graphrt::tensor::{decode, encode};
use graphrt::{BackendCapabilities, Device, FeatureLevel, GraphExecutor, GraphInfo};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "graphrt", version, about = "Compiles a tensor graph and runs it")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compiles a graph and computes it once.
    Run {
        /// JSON graph description.
        #[arg(long)]
        graph: PathBuf,

        /// JSON object mapping each input name to its values.
        #[arg(long)]
        inputs: PathBuf,

        #[arg(long)]
        unified_memory: bool,

        #[arg(long, default_value_t = FeatureLevel::default())]
        feature_level: FeatureLevel,

        /// Bytes the device may have allocated at once.
        #[arg(long)]
        memory_budget: Option<u64>,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Encodes each named input with the element type its operand declares.
fn encode_inputs(graph: &GraphInfo, values: BTreeMap<String, Vec<f64>>) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    values
        .into_iter()
        .map(|(name, values)| {
            let operand = graph
                .input_operands
                .iter()
                .filter_map(|id| graph.operands.get(id))
                .find(|operand| operand.name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| anyhow!("the graph has no input named {:?}", name))?;
            let bytes = encode(operand.data_type, &values);
            Ok((name, bytes))
        })
        .collect()
}

fn decode_outputs(graph: &GraphInfo, outputs: BTreeMap<String, Vec<u8>>) -> anyhow::Result<BTreeMap<String, Vec<f64>>> {
    outputs
        .into_iter()
        .map(|(name, bytes)| {
            let operand = graph
                .output_operands
                .iter()
                .filter_map(|id| graph.operands.get(id))
                .find(|operand| operand.name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| anyhow!("the graph has no output named {:?}", name))?;
            Ok((name, decode(operand.data_type, &bytes)?))
        })
        .collect()
}

fn run(
    graph: PathBuf,
    inputs: PathBuf,
    capabilities: BackendCapabilities,
) -> anyhow::Result<BTreeMap<String, Vec<f64>>> {
    let graph: GraphInfo = read_json(&graph)?;
    let inputs = encode_inputs(&graph, read_json(&inputs)?)?;
    let device = Device::new(capabilities).context("failed to create the device")?;

    block_on(async {
        let executor = GraphExecutor::compile(&device, &graph).await?;
        info!(outputs = graph.output_operands.len(), "compiled");
        let outputs = executor.compute(&inputs).await?;
        decode_outputs(&graph, outputs)
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Run {
            graph,
            inputs,
            unified_memory,
            feature_level,
            memory_budget,
        } => {
            let capabilities = BackendCapabilities {
                feature_level,
                unified_memory,
                memory_budget,
            };
            let outputs = run(graph, inputs, capabilities)?;
            println!("{}", serde_json::to_string_pretty(&outputs)?);
        }
    }
    Ok(())
}
