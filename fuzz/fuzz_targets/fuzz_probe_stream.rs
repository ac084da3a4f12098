#![no_main]
use std::time::{Duration, Instant};

use libfuzzer_sys::fuzz_target;
use phdoser_config::PhRange;
use phdoser_core::{Command, CommandKind, FilterParams, LineFramer, MAX_BUFFER_LENGTH, ProtocolEngine};

fuzz_target!(|data: &[u8]| {
    // First byte picks the chunk size so the same bytes arrive split differently.
    let Some((&split, bytes)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(split % 32) + 1;

    let mut framer = LineFramer::new();
    let mut engine = ProtocolEngine::new();
    engine.enqueue(Command::new("Cal,mid,7.00", CommandKind::Calibration));
    engine.enqueue(Command::new("Slope,?", CommandKind::SlopeQuery));
    let params = FilterParams::default();
    let range = PhRange::default();
    let t0 = Instant::now();

    for (i, piece) in bytes.chunks(chunk).enumerate() {
        let framed = framer.push(piece);
        for line in &framed.lines {
            assert!(!line.is_empty());
            // Each char came from at least one buffered byte; U+FFFD widens to three.
            assert!(line.chars().count() <= MAX_BUFFER_LENGTH);
        }
        let now = t0 + Duration::from_millis(i as u64 * 250);
        let _ = engine.process(&framed.lines, &params, range, now);
        // Responses only drain the queue, never grow it.
        assert!(engine.queued() <= 2);
    }
});
