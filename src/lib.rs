//! Process-wide entry points: [`init`]/[`cleanup`] wrap the logger and the
//! global socket table, matching the "network init/teardown pair" rule
//! the rest of the workspace follows for ambient process state.

pub mod error;
pub mod options;
pub mod socket;

pub use error::{Error, Result};
pub use options::{OptionName, OptionValue, Options, PostOptions, PreOptions};
pub use socket::{SocketId, SocketTable, Stats};
pub use transport::ConnState;

use std::sync::OnceLock;

use log::LevelFilter;

static TABLE: OnceLock<SocketTable> = OnceLock::new();

/// Install the logger and the global socket table. Safe to call more than
/// once; the logger install is idempotent (see [`runtime::init`]) and the
/// table is only created on the first call.
pub fn init(level: LevelFilter) {
	runtime::init(level);
	TABLE.get_or_init(SocketTable::new);
}

/// The process-wide socket table, installed by [`init`]. Panics if called
/// before `init`, matching the rest of the workspace's "ambient state must
/// be explicitly initialized" convention.
pub fn table() -> &'static SocketTable {
	TABLE.get().expect("lltp::init must be called before using the socket API")
}

/// Release every socket still open. Does not uninstall the logger, since
/// `log` has no mechanism to do so; matches `runtime`'s shutdown-hook
/// pattern for processes that want a clean Ctrl-C teardown.
pub fn cleanup() {
	if let Some(table) = TABLE.get() {
		log::info!("releasing socket table on cleanup");
		table.close_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn init_then_table_creates_sockets() {
		init(LevelFilter::Off);
		let id = table().create_socket().unwrap();
		assert!(table().get_sockstate(id).is_ok());
	}
}
