//! Ambient process-wide state: the logger and a couple of small helpers
//! shared by every other crate in the workspace. Mirrors the "process init
//! / teardown pair wraps the logger" rule: call [`init`] once at process
//! start and optionally [`on_shutdown_signal`] to run cleanup on Ctrl-C.

pub mod logger;
pub mod time;

use std::sync::Mutex;

use log::LevelFilter;

static LOGGER: logger::Logger = logger::Logger;

/// Install the process-wide logger. A second call only logs a warning
/// rather than panicking, since tests may call `init` from more than one
/// thread.
pub fn init(level: LevelFilter) {
	if log::set_logger(&LOGGER).is_err() {
		log::warn!("logger already installed, ignoring second runtime::init call");
		return;
	}

	log::set_max_level(level);
}

type ShutdownHook = Box<dyn FnOnce() + Send>;

static SHUTDOWN_HOOK: Mutex<Option<ShutdownHook>> = Mutex::new(None);

/// Register `f` to run once on the first Ctrl-C / SIGTERM. Intended for
/// an application embedding the transport to drive a clean `lltp::cleanup()`.
pub fn on_shutdown_signal(f: impl FnOnce() + Send + 'static) {
	*SHUTDOWN_HOOK.lock().unwrap() = Some(Box::new(f));

	if let Err(e) = ctrlc::set_handler(|| {
		if let Some(f) = SHUTDOWN_HOOK.lock().unwrap().take() {
			f();
		}
	}) {
		log::warn!("failed to install shutdown signal handler: {e}");
	}
}
