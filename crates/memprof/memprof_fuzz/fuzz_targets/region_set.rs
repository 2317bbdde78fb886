#![no_main]

use std::sync::Once;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use log::info;
use memprof::{ProfilerConfig, RegionSet};

static INIT_ONCE: Once = Once::new();

/// Offsets and lengths are kept small so accesses collide often
#[derive(Arbitrary, Debug)]
struct Access {
    offset: u16,
    len: u8,
}

#[derive(Arbitrary, Debug)]
struct Input {
    cache_line_shift: u8,
    accesses: Vec<Access>,
}

const SPACE: usize = u16::MAX as usize + u8::MAX as usize + 1;

fuzz_target!(|input: Input| {
    INIT_ONCE.call_once(env_logger::init);

    let line = 1 << (input.cache_line_shift % 8);
    let mut set = RegionSet::new(ProfilerConfig::new(line, 16).unwrap());
    let mut touched = vec![false; SPACE];
    let mut total_bytes = 0_u64;
    let mut accesses = 0_u64;

    for access in &input.accesses {
        let start = usize::from(access.offset);
        let len = usize::from(access.len);
        set.record_access(start, len);
        if len > 0 {
            touched[start..start + len].fill(true);
            total_bytes += len as u64;
            accesses += 1;
        }
        set.check_invariant().unwrap();
    }
    info!("{} accesses, {} regions", input.accesses.len(), set.len());

    assert_eq!(
        set.iter().map(|region| region.total_bytes_accessed).sum::<u64>(),
        total_bytes
    );
    assert_eq!(
        set.iter().map(|region| region.histogram.accesses()).sum::<u64>(),
        accesses
    );

    // Regions cover exactly the touched bytes
    let covered: usize = set.iter().map(|region| region.size()).sum();
    assert_eq!(covered, touched.iter().filter(|byte| **byte).count());
    for region in set.iter() {
        assert!(touched[region.start..=region.end].iter().all(|byte| *byte));
    }

    assert!(set
        .export("fuzz", memprof::AccessKind::Write)
        .iter()
        .all(|record| !record.is_fault()));
});
