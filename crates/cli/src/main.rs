use std::thread;

use anyhow::Context;
use benchmarks::operator::{AttentionShape, GdpaOperator, Mode, Operator};
use clap::{CommandFactory, Parser, Subcommand};
use cli::handlers::{RunOptions, handle_bench, handle_list, handle_run};
use gdpa::{Activation, AttentionParams, DataType};

#[derive(Parser)]
#[command(version = gdpa::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List operators, their backends and built-in shape sweeps
    List,
    /// Measure every backend of an operator on one shape or its built-in sweep
    Run {
        /// gdpa, addmm, layer_norm, welford or int4_gemm
        #[arg(long, default_value = "gdpa")]
        op: String,
        /// Sweep point as JSON in the operator's shape format; attention
        /// shapes can also be given with the flags below
        #[arg(long)]
        shape: Option<String>,
        /// Pass to measure: fwd or bwd
        #[arg(long, default_value = "fwd")]
        mode: Mode,
        #[arg(long, default_value_t = 1)]
        batch: usize,
        #[arg(long, default_value_t = 4)]
        heads: usize,
        /// Key/value heads; defaults to `heads`
        #[arg(long)]
        kv_heads: Option<usize>,
        #[arg(long, default_value_t = 512)]
        seq_len_q: usize,
        /// Defaults to `seq_len_q`
        #[arg(long)]
        seq_len_kv: Option<usize>,
        #[arg(long, default_value_t = 128)]
        head_dim: usize,
        /// Defaults to `head_dim`
        #[arg(long)]
        head_dim_v: Option<usize>,
        /// Draw sequence lengths at random up to the maximum
        #[arg(long)]
        ragged: bool,
        /// identity, gelu or fast_gelu
        #[arg(long, default_value = "fast_gelu")]
        activation: Activation,
        #[arg(long)]
        causal: bool,
        #[arg(long)]
        window_size: Option<usize>,
        /// bf16, f16 or f32; the operator's default when omitted
        #[arg(long)]
        dtype: Option<DataType>,
        /// Persistent units; defaults to the available parallelism
        #[arg(long)]
        units: Option<usize>,
        /// Backends to measure; all when omitted
        #[arg(long)]
        backend: Vec<String>,
        #[arg(long, default_value_t = 1)]
        warmup: usize,
        #[arg(long, default_value_t = 5)]
        iterations: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Run a benchmark task file and write the results as JSON
    Bench {
        /// Path to the task description
        task_path: String,
        /// Path the results are written to
        output_path: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::List) => {
            handle_list();
        },
        Some(Commands::Run {
            op,
            shape,
            mode,
            batch,
            heads,
            kv_heads,
            seq_len_q,
            seq_len_kv,
            head_dim,
            head_dim_v,
            ragged,
            activation,
            causal,
            window_size,
            dtype,
            units,
            backend,
            warmup,
            iterations,
            seed,
        }) => {
            let multiprocessor_count = units.unwrap_or_else(|| {
                thread::available_parallelism().map_or(1, |count| count.get())
            });
            let shape = shape
                .map(|shape| {
                    serde_json::from_str::<serde_json::Value>(&shape)
                        .context("Shape is not valid JSON")
                })
                .transpose()?;
            let (shape, params) = if op == GdpaOperator::NAME {
                let attention_shape = AttentionShape {
                    batch,
                    heads,
                    kv_heads: kv_heads.unwrap_or(heads),
                    max_seq_len_q: seq_len_q,
                    max_seq_len_kv: seq_len_kv.unwrap_or(seq_len_q),
                    head_dim,
                    head_dim_v: head_dim_v.unwrap_or(head_dim),
                    ragged,
                };
                let params = AttentionParams {
                    activation,
                    causal,
                    window_size,
                    qk_scale: 1.0 / (head_dim as f32).sqrt(),
                    data_type: dtype.unwrap_or(DataType::BF16),
                };
                let shape = match shape {
                    Some(shape) => shape,
                    None => serde_json::to_value(attention_shape)?,
                };
                (Some(shape), serde_json::to_value(params)?)
            } else {
                let params = match dtype {
                    Some(data_type) => serde_json::json!({ "data_type": data_type }),
                    None => serde_json::Value::Null,
                };
                (shape, params)
            };
            handle_run(RunOptions {
                operator: op,
                mode,
                shape,
                params,
                multiprocessor_count,
                backends: backend,
                warmup,
                iterations,
                seed,
            })?;
        },
        Some(Commands::Bench {
            task_path,
            output_path,
        }) => {
            handle_bench(task_path, output_path)?;
        },
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
        },
    }

    Ok(())
}
