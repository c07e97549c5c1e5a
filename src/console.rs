use core::fmt;

use hermit_sync::TicketMutex;

use crate::arch;

pub(crate) struct Console(());

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		arch::output_message_buf(s.as_bytes());
		Ok(())
	}
}

static CONSOLE: TicketMutex<Console> = TicketMutex::new(Console(()));

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use core::fmt::Write;
	CONSOLE.lock().write_fmt(args).ok();
}
