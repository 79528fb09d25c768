use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::SystemTime;

use memory_stats::memory_stats;
use tracing_flame::FlameLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use ulvm::decode::decode;
use ulvm::gc::TracingGc;
use ulvm::interp::{start, DefaultEvaluationStrategy, Machine, Strategy};
use ulvm::linker::link;
use ulvm::native::NoNativeFunctions;

fn setup_global_subscriber() -> impl Drop {
	let file = File::create("./trace.folded").unwrap();
	let flame_layer = FlameLayer::new(BufWriter::new(file)).with_file_and_line(false);
	let guard = flame_layer.flush_on_drop();

	let subscriber = Registry::default()
		.with(flame_layer);

	tracing::subscriber::set_global_default(subscriber).expect("Could not set global default");
	guard
}

/// Loads a standalone image from disk, links it, and runs its entry point,
/// printing wall-clock time and resident memory at each stage.
fn main() {
	let _guard = setup_global_subscriber();

	let path = std::env::args().nth(1).expect("usage: ulvm-demos <image-path>");

	let mut clock = SystemTime::now();
	let bytes = std::fs::read(&path).expect("failed to read image");
	let program = decode(&bytes).expect("failed to decode image");

	println! {
		"Decode time: {:?}, RAM: {}MB",
		clock.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	clock = SystemTime::now();
	let gc = Arc::new(TracingGc::new());
	let env = link(vec![program], gc.as_ref()).expect("failed to link image");

	println! {
		"Link time: {:?}, RAM: {}MB",
		clock.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	let entry = env.entry_fun;
	let machine = Machine::new(gc, env, Box::new(NoNativeFunctions), Box::new(DefaultEvaluationStrategy { default: Strategy::Eager }));

	clock = SystemTime::now();
	let result = start(&machine, entry, &[]).expect("entry point faulted");

	println! {
		"Run time: {:?}, RAM: {}MB",
		clock.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	println!("Result: {:?}", result.as_int().or_else(|| result.as_float().map(|f| f as i64)));
}
