#[cfg(all(test, feature = "std"))]
mod tests {
    use memprof::{
        events::parse_event_log, AccessKind, CsvSink, MemoryEventHandler, ProfilerConfig,
        Replayer, ScopeController, ScopeTable, TraceRecord, VecSink,
    };

    const SESSION: &str = "
        write 0x500 8
        enter init
        write 0 16
        write 16 16
        read 0x100 4
        malloc 0x1000 0x100 main
        memalign 0x2000 0x20 0x40 fftw_malloc
        free 0x1000 main
        free 0x3000 main
        exit init
        enter run
        read 0x200 8
        exit run
    ";

    fn config() -> ProfilerConfig {
        ProfilerConfig::new(64, 64).unwrap()
    }

    fn table(names: &[&str]) -> ScopeTable {
        let mut scopes = ScopeTable::new();
        for name in names {
            scopes.register(name);
        }
        scopes
    }

    #[test]
    fn test_init_scope_csv() {
        let events = parse_event_log(SESSION).unwrap();
        let controller = ScopeController::new(config(), table(&["init"]), CsvSink::new(Vec::new()));
        let mut replayer = Replayer::new(controller, false);
        replayer.run(&events).unwrap();

        let sink = replayer.into_handler().into_sink();
        assert_eq!(sink.faults(), 0);
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            [
                "init,enter",
                "init,malloc,size=0x100,data_ptr=0x1000,caller=main",
                "init,memalign,boundary=0x20,size=0x40,data_ptr=0x2000,caller=fftw_malloc",
                "init,free,data_ptr=0x1000,size=0x100,caller=main",
                "init,free,data_ptr=0x3000,size=unknown,caller=main",
                "init,exit",
                "init,memory read,start_addr=0x100,end_addr=0x103,size=0x4,total_bytes_accessed=0x4,4 byte accesses=0x1",
                "init,memory write,start_addr=0x0,end_addr=0x1f,size=0x20,total_bytes_accessed=0x20,16 byte accesses=0x2",
                "N/A,outstanding_allocations,0x2000(0x40)",
            ]
        );
    }

    #[test]
    fn test_scopes_run_one_after_the_other() {
        let events = parse_event_log(SESSION).unwrap();
        let controller = ScopeController::new(config(), table(&["init", "run"]), VecSink::new());
        let mut replayer = Replayer::new(controller, false);
        replayer.run(&events).unwrap();

        let controller = replayer.into_handler();
        let records = controller.sink().records();
        let exits: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, record)| matches!(record, TraceRecord::ScopeExited { .. }))
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(exits.len(), 2);

        // `run` only reports its own read
        let TraceRecord::Region { scope, access, region } = &records[exits[1] + 1] else {
            panic!("expected a region after `run,exit`");
        };
        assert_eq!(scope, "run");
        assert_eq!(*access, AccessKind::Read);
        assert_eq!((region.start, region.end), (0x200, 0x207));
        assert!(controller.writes().is_empty());
        assert!(records.iter().all(|record| !record.is_fault()));
    }

    #[test]
    fn test_direct_driving() {
        let mut scopes = ScopeTable::new();
        let init = scopes.register("init");
        let mut controller = ScopeController::new(config(), scopes, VecSink::new());

        controller.on_scope_enter(init).unwrap();
        for offset in (0..256).step_by(8) {
            controller.on_access(0x4000 + offset, 8, AccessKind::Write);
        }
        controller.on_access(0x3ffc, 8, AccessKind::Write);

        let writes = controller.writes();
        assert_eq!(writes.len(), 1);
        let region = writes.iter().next().unwrap();
        assert_eq!((region.start, region.end), (0x3ffc, 0x40ff));
        assert_eq!(region.total_bytes_accessed, 33 * 8);
        assert_eq!(region.growth_up_count, 3);
        assert_eq!(region.growth_down_count, 1);
        writes.check_invariant().unwrap();

        MemoryEventHandler::on_scope_exit(&mut controller, init).unwrap();
        MemoryEventHandler::shutdown(&mut controller).unwrap();
        assert_eq!(
            controller.sink().records().last(),
            Some(&TraceRecord::OutstandingAllocations { entries: vec![] })
        );
    }
}
