use futures::TryStreamExt;
use sluice::{
    Chunk, Encoding, Pipeline, Readable, Scheduler, StreamOptions, Transform, TransformDone,
    TransformOptions, Transformer,
};

/// Re-chunks a byte stream into lines.
#[derive(Default)]
pub struct LineSplitter {
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

#[tokio::main]
async fn main() {
    let scheduler = Scheduler::new();
    let text = vec!["first li", "ne\nsecond line\nthi", "rd line\n", "no newline at the end"];

    let source = Readable::<()>::from_iter(&scheduler, text, StreamOptions::default());
    let splitter = Transform::new(
        &scheduler,
        TransformOptions::default().readable(StreamOptions::object()),
        LineSplitter::default(),
    );

    let (lines, handle) = Pipeline::from(source).through(&splitter).build();
    let lines: Vec<_> = match scheduler.run_until(lines.try_collect::<Vec<_>>()).await {
        Ok(lines) => lines,
        Err(err) => {
            eprintln!("pipeline failed: {err}");
            return;
        }
    };

    for line in lines.into_iter().filter_map(Chunk::into_value) {
        println!("{line}");
    }
    println!("{:?}", scheduler.run_until(handle.finished()).await);
}
