#![no_main]

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use cpulink_minicore::MiniCoreFactory;
use cpulink_protocol::{CoreFactory, Environment, Transaction, API_VERSION, PAGE_SIZE};
use cpulink_runner::{MemoryRegion, RunnerEnv};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 16 {
        return;
    }

    let region = match MemoryRegion::new(PAGE_SIZE * 2, PAGE_SIZE) {
        Ok(region) => region,
        Err(_) => return,
    };
    let env = Arc::new(RunnerEnv::with_sink(
        region,
        0x4000_0000,
        BTreeMap::new(),
        Box::new(io::sink()),
    ));

    // Arbitrary bytes become the code image; reserved words execute as
    // NOPs, so every image is steppable.
    {
        let mut image = data.to_vec();
        image.truncate(PAGE_SIZE as usize);
        let mut tx = Transaction::write(0, &mut image);
        let _ = env.transport(&mut tx);
    }

    // Arbitrary transactions against the engine must never panic.
    let addr = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let len = usize::from(data[8]) + 1;
    let mut buf = vec![0u8; len];
    let mut tx = Transaction::read(addr, &mut buf);
    let _ = env.transport(&mut tx);
    let mut tx = Transaction::write(addr % (PAGE_SIZE * 4), &mut buf);
    let _ = env.transport(&mut tx);

    let factory = MiniCoreFactory::new();
    let Some(mut core) = factory.create(
        API_VERSION,
        Arc::clone(&env) as Arc<dyn Environment>,
        "mini32",
    ) else {
        return;
    };

    let quantum = u64::from(u16::from_le_bytes(data[9..11].try_into().unwrap())) + 1;
    for _ in 0..4 {
        let _ = core.step(quantum);
    }
});
