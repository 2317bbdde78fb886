#![no_main]

use std::sync::Once;

use libfuzzer_sys::fuzz_target;
use memprof::{
    events::{parse_event_log, to_postcard},
    MemoryEvent, NopSink, ProfilerConfig, Replayer, ScopeController, ScopeTable,
};

static INIT_ONCE: Once = Once::new();

fuzz_target!(|data: &[u8]| {
    INIT_ONCE.call_once(env_logger::init);

    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(events) = parse_event_log(text) else {
        return;
    };

    for event in &events {
        assert_eq!(&event.to_string().parse::<MemoryEvent>().unwrap(), event);
    }
    assert_eq!(
        memprof::events::from_postcard(&to_postcard(&events).unwrap()).unwrap(),
        events
    );

    let controller = ScopeController::new(
        ProfilerConfig::new(64, 64).unwrap(),
        ScopeTable::new(),
        NopSink::new(),
    );
    let mut replayer = Replayer::new(controller, true);
    replayer.run(&events).unwrap();

    let controller = replayer.into_handler();
    controller.reads().check_invariant().unwrap();
    controller.writes().check_invariant().unwrap();
});
