use alloctrace::{AllocTracer, RcFunction, RcHeap, TextFormatWriter};

fn main() {
  let heap = RcHeap::new();
  let mut tracer = AllocTracer::new(heap.clone());

  let build = RcFunction::new(
    "buildCache",
    Some("/demo/cache.js"),
    Some("entries.push(make());\n"),
  );
  let parse = RcFunction::new(
    "parseRow",
    Some("/demo/parse.js"),
    Some("return { id, name };\n"),
  );

  let mut rows = Vec::new();
  let mut frame = tracer.scoped_frame(build);
  for _ in 0..40 {
    let obj = heap.alloc_composite(4);
    frame.record(&obj);
    rows.push(obj);
  }
  drop(frame);

  let mut frame = tracer.scoped_frame(parse);
  let scratch = heap.alloc_string(&["tmp", "-row"]);
  frame.record(&scratch);
  drop(frame);

  heap.release(&scratch);
  drop(scratch);

  println!("=== detailed report ===");
  let mut writer = TextFormatWriter::new(std::io::stdout());
  if let Err(err) = tracer.write_report(&mut writer) {
    eprintln!("report failed: {err}");
  }
  println!();

  println!("=== summary ===");
  for record in tracer.summary().records() {
    println!(
      "{} live={} size={}B allocs={}",
      record.function, record.live_count, record.live_size, record.alloc_count
    );
  }
}
