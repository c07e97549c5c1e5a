use log::{LevelFilter, Metadata, Record};

/// Filters and formats all kernel messages behind the `log` facade.
struct KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			println!(
				"[{}][{}] {}",
				crate::arch::core_local::core_id(),
				record.level(),
				record.args()
			);
		}
	}
}

pub unsafe fn init() {
	static LOGGER: KernelLogger = KernelLogger;

	log::set_logger(&LOGGER).expect("logging already initialized");
	log::set_max_level(LevelFilter::Info);
}
