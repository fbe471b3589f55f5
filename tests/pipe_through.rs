use std::{cell::RefCell, rc::Rc, time::Duration};

use futures::TryStreamExt;
use sluice::{
    Chunk, Done, Encoding, Event, Pipeline, Readable, Scheduler, StreamError, StreamOptions, Transform,
    TransformDone, TransformOptions, Transformer, Writable,
};

#[derive(Default)]
struct LineSplitter {
    partial: String,
}

impl Transformer<(), String> for LineSplitter {
    fn transform(&mut self, chunk: Chunk<()>, _: Encoding, done: TransformDone<String>) {
        if let Some(bytes) = chunk.as_bytes() {
            self.partial.push_str(&String::from_utf8_lossy(bytes));
        }
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            done.push(Chunk::Value(line.trim_end().to_string()));
        }
        done.ok()
    }

    fn flush(&mut self, done: TransformDone<String>) {
        if self.partial.is_empty() {
            return done.ok();
        }
        done.complete_with(Chunk::Value(std::mem::take(&mut self.partial)))
    }
}

fn splitter(scheduler: &Scheduler) -> Transform<(), String> {
    Transform::new(
        scheduler,
        TransformOptions::default().readable(StreamOptions::object()),
        LineSplitter::default(),
    )
}

#[tokio::test]
async fn lines_are_split_across_chunk_boundaries() {
    let scheduler = Scheduler::new();
    let source = Readable::<()>::from_iter(&scheduler, vec!["ab\ncd", "e\nf"], StreamOptions::default());

    let (lines, handle) = Pipeline::from(source).through(&splitter(&scheduler)).build();
    let out: Vec<_> = scheduler
        .run_until(lines.try_collect::<Vec<_>>())
        .await
        .unwrap();

    assert_eq!(
        out,
        vec![
            Chunk::Value("ab".to_string()),
            Chunk::Value("cde".to_string()),
            Chunk::Value("f".to_string()),
        ]
    );
    assert_eq!(scheduler.run_until(handle.finished()).await, Ok(()));
}

#[tokio::test]
async fn a_slow_sink_pauses_the_source() {
    let scheduler = Scheduler::new();
    let source = Readable::from_values(&scheduler, 0..100u32);

    let pauses = Rc::new(RefCell::new(0usize));
    let p = pauses.clone();
    source.on(move |event| {
        if matches!(event, Event::Pause) {
            *p.borrow_mut() += 1;
        }
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    let (s, sched) = (seen.clone(), scheduler.clone());
    let sink: Writable<u32> = Writable::new(
        &scheduler,
        StreamOptions::object().high_water_mark(4),
        move |chunk: Chunk<u32>, _: Encoding, done: Done| {
            s.borrow_mut().extend(chunk.into_value());
            sched.spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                done.ok();
            });
        },
    );

    let handle = Pipeline::from(source.clone()).into_sink(&sink);
    assert_eq!(scheduler.run_until(handle.finished()).await, Ok(()));

    assert_eq!(*seen.borrow(), (0..100).collect::<Vec<_>>());
    assert!(source.is_destroyed());
    assert!(*pauses.borrow() > 0);
}

#[tokio::test]
async fn a_failing_sink_stops_the_source() {
    let scheduler = Scheduler::new();
    let source = Readable::from_values(&scheduler, 0..10u32);
    let sink: Writable<u32> = Writable::new(
        &scheduler,
        StreamOptions::object(),
        |chunk: Chunk<u32>, _: Encoding, done: Done| match chunk.into_value() {
            Some(3) => done.fail(StreamError::msg("disk full")),
            _ => done.ok(),
        },
    );

    let handle = Pipeline::from(source.clone()).into_sink(&sink);
    let err = scheduler.run_until(handle.finished()).await.unwrap_err();
    scheduler.run_until_idle();

    assert_eq!(err.to_string(), "disk full");
    assert!(source.is_destroyed());
    assert_eq!(source.errored().map(|err| err.to_string()), Some("disk full".into()));
}
