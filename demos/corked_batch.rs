use std::time::Duration;

use sluice::{BatchEntry, Chunk, Done, Encoding, Event, Scheduler, StreamOptions, Writable};

// Writes queued while corked reach the batch hook as one call. A slow resource makes the
// writes issued meanwhile pile up and get batched as well.
#[tokio::main]
async fn main() {
    let scheduler = Scheduler::new();

    let one = scheduler.clone();
    let many = scheduler.clone();
    let writable = Writable::<()>::builder(&scheduler)
        .options(StreamOptions::default().high_water_mark(16))
        .dispatch(move |chunk: Chunk<()>, _: Encoding, done: Done| {
            println!("single write of {} bytes", chunk.units());
            one.spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.ok();
            });
        })
        .batch(move |entries: Vec<BatchEntry<()>>, done: Done| {
            let total: usize = entries.iter().map(|entry| entry.chunk.units()).sum();
            println!("batched write of {} chunks, {total} bytes", entries.len());
            many.spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.ok();
            });
        })
        .build();

    writable.on(|event| {
        if matches!(event, Event::Drain | Event::Finish) {
            println!("{}", event.name());
        }
    });

    writable.cork();
    for word in ["cork", "ed ", "writes ", "travel ", "together"] {
        let _ = writable.write(word);
    }
    writable.uncork();

    for n in 0..8 {
        match writable.write(format!("line {n}\n")) {
            Ok(true) => {}
            Ok(false) => println!("backpressure after line {n}"),
            Err(err) => eprintln!("write failed: {err}"),
        }
    }

    writable.end();
    if let Err(err) = scheduler.run_until(writable.finished()).await {
        eprintln!("stream failed: {err}");
    }
}
