//! Serial port driver for debug output
//!
//! Kernel log output goes to COM1 on bare-metal x86_64 builds. Hosted
//! builds have no UART: under `cfg(test)` the output is forwarded to
//! stderr so failing tests keep their kernel log, otherwise it is
//! discarded.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod com1 {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    /// Standard COM1 port address
    const SERIAL_IO_PORT: u16 = 0x3F8;

    lazy_static! {
        /// Global serial port instance protected by spinlock
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut serial_port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }
}

/// Force initialization of the lazily-created port so the first log line
/// does not pay the setup cost in an awkward context.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let _ = com1::SERIAL1.lock();
    }
}

/// Print to the serial sink (internal use)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use core::fmt::Write;
        use x86_64::instructions::interrupts;

        // Disable interrupts to prevent deadlock against IRQ-context logging
        interrupts::without_interrupts(|| {
            com1::SERIAL1
                .lock()
                .write_fmt(args)
                .expect("serial write failed");
        });
    }
    #[cfg(all(test, not(all(target_arch = "x86_64", target_os = "none"))))]
    {
        std::eprint!("{}", args);
    }
    #[cfg(not(any(all(target_arch = "x86_64", target_os = "none"), test)))]
    {
        let _ = args;
    }
}

/// Print to the serial sink
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to the serial sink with newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
