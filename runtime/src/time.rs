use std::time::SystemTime;

/// Format the current wall-clock time for a log line. This is the one
/// place `SystemTime` may be read by the core: all protocol timing must
/// go through `seqtime::clock::SteadyClock` instead, so that NTP steps
/// and manual clock adjustments never leak into RTT/TSBPD math.
pub fn system_now_string() -> String {
	humantime::format_rfc3339_nanos(SystemTime::now()).to_string()
}

/// Get the current UNIX time in seconds, used to seed a connection's
/// `start_time` for logging and for the handshake cookie's coarse clock.
pub fn unix_now() -> u32 {
	SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.expect("the current time should be after the UNIX epoch")
		.as_secs()
		.try_into()
		.expect("32-bit UNIX time should not overflow")
}
