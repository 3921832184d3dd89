//! Subprocess vat worker. Speaks length-prefixed JSON frames on
//! stdin/stdout; logs go to stderr.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use swing_worker::{
    DEFAULT_DELIVERY_FUEL, FramedTransport, NativeVatRegistry, VatLoader, WasmVatRuntime,
    run_worker,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "swing-vat-worker", version, about = "Runs one vat for a SwingSet kernel")]
struct Args {
    /// Directory for compiled wasm modules
    #[arg(long)]
    module_cache_dir: Option<PathBuf>,

    /// Fuel available to each delivery
    #[arg(long, default_value_t = DEFAULT_DELIVERY_FUEL)]
    delivery_fuel: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging();

    let runtime =
        WasmVatRuntime::new_with_disk_cache(args.module_cache_dir)?.with_delivery_fuel(args.delivery_fuel);
    let loader = VatLoader::new(NativeVatRegistry::new(), Some(Arc::new(runtime)));
    let transport = FramedTransport::new(io::stdin(), io::stdout());
    run_worker(Box::new(transport), &loader)?;
    Ok(())
}

/// Stdout carries the protocol, so logs go to stderr.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
