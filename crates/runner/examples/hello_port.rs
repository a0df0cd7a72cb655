//! Minimal end-to-end demo: one reference core prints through the
//! memory-mapped output port.
//!
//! ```sh
//! cargo run -p cpulink-runner --example hello_port
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use cpulink_minicore::{encode_halt, encode_movi, encode_out, PROVIDER};
use cpulink_protocol::{Environment, Transaction, API_VERSION};
use cpulink_runner::{default_registry, MemoryRegion, RunnerEnv, Scheduler};
use proptest as _;
use rstest as _;
use tempfile as _;
use thiserror as _;

fn main() {
    let region = match MemoryRegion::new(0x1000, 0x1000) {
        Ok(region) => region,
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(1);
        }
    };
    let env = Arc::new(RunnerEnv::new(region, 0x4000_0000, BTreeMap::new()));

    let mut image = Vec::new();
    for byte in "hello from the port\n".bytes() {
        image.push(encode_movi(0, u16::from(byte)));
        image.push(encode_out(0));
    }
    image.push(encode_halt());

    for (index, word) in image.into_iter().enumerate() {
        let mut bytes = word.to_le_bytes();
        let mut tx = Transaction::write(index as u64 * 4, &mut bytes);
        assert!(env.transport(&mut tx).is_ok(), "image must fit the region");
    }

    let registry = default_registry();
    let factory = registry.resolve(PROVIDER).expect("reference provider is registered");
    let core = factory
        .create(
            API_VERSION,
            Arc::clone(&env) as Arc<dyn Environment>,
            "mini32",
        )
        .expect("reference core instantiates");

    let scheduler = Scheduler::launch(&env, vec![core], 1_000, 0);
    for report in scheduler.join() {
        eprintln!(
            "core {} retired {} instructions",
            report.core_index, report.instructions
        );
    }
}
