use wire::PacketBoundary;

/// A receive-buffer cell's lifecycle. Transitions are monotone:
/// `Empty -> Available -> Read`, or `Empty|Available -> Dropped` with
/// `Dropped` terminal.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CellState {
	#[default]
	Empty,
	Available,
	Read,
	Dropped,
}

#[derive(Clone, Default)]
pub struct Cell {
	pub state: CellState,
	pub seq: u32,
	pub msgno: u32,
	pub boundary: PacketBoundary,
	pub inorder: bool,
	pub payload: Vec<u8>,
	pub timestamp_us: u32,
	/// Local arrival time, used for TSBPD play-time computation.
	pub arrival_time_us: u64,
}

impl Cell {
	pub fn occupy(&mut self, seq: u32, msgno: u32, boundary: PacketBoundary, inorder: bool, payload: Vec<u8>, timestamp_us: u32, arrival_time_us: u64) {
		*self = Cell { state: CellState::Available, seq, msgno, boundary, inorder, payload, timestamp_us, arrival_time_us };
	}

	pub fn clear(&mut self) {
		*self = Cell::default();
	}
}
