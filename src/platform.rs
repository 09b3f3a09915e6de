use anyhow::Result;
use crossbeam_channel::Sender;
use std::process;
use std::thread;

#[cfg(windows)]
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use signal_hook::{consts::SIGINT, consts::SIGTERM, iterator::Signals};

#[cfg(windows)]
use signal_hook::{consts::SIGINT, flag};

/// Standard Unix exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidUsage = 2,
    SignalInt = 130,  // 128 + SIGINT (2)
    SignalTerm = 143, // 128 + SIGTERM (15)
}

impl ExitCode {
    pub fn exit(self) -> ! {
        process::exit(self as i32)
    }
}

/// Control messages broadcast by the signal handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ctrl {
    Shutdown { immediate: bool },
}

/// Turns SIGINT/SIGTERM into [`Ctrl::Shutdown`] messages. The first signal
/// asks for a graceful stop, the second exits on the spot.
pub struct SignalHandler {
    _handle: thread::JoinHandle<()>,
}

impl SignalHandler {
    pub fn new(ctrl_sender: Sender<Ctrl>) -> Result<Self> {
        #[cfg(unix)]
        {
            let mut signals = Signals::new([SIGINT, SIGTERM])?;

            let handle = thread::Builder::new()
                .name("signals".to_string())
                .spawn(move || {
                    let mut shutdown_count = 0;
                    for sig in signals.forever() {
                        let code = match sig {
                            SIGINT => ExitCode::SignalInt,
                            SIGTERM => ExitCode::SignalTerm,
                            _ => continue,
                        };
                        shutdown_count += 1;
                        let immediate = shutdown_count > 1;
                        tracing::warn!(signal = sig, immediate, "shutdown requested");
                        let _ = ctrl_sender.send(Ctrl::Shutdown { immediate });
                        if immediate {
                            code.exit();
                        }
                    }
                })?;

            Ok(SignalHandler { _handle: handle })
        }

        #[cfg(windows)]
        {
            let term_flag = std::sync::Arc::new(AtomicBool::new(false));
            flag::register(SIGINT, std::sync::Arc::clone(&term_flag))?;

            let handle = thread::Builder::new()
                .name("signals".to_string())
                .spawn(move || {
                    let mut shutdown_count = 0;
                    loop {
                        thread::sleep(std::time::Duration::from_millis(100));
                        if term_flag.swap(false, Ordering::Relaxed) {
                            shutdown_count += 1;
                            let immediate = shutdown_count > 1;
                            let _ = ctrl_sender.send(Ctrl::Shutdown { immediate });
                            if immediate {
                                ExitCode::SignalInt.exit();
                            }
                        }
                    }
                })?;

            Ok(SignalHandler { _handle: handle })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::GeneralError as i32, 1);
        assert_eq!(ExitCode::InvalidUsage as i32, 2);
        assert_eq!(ExitCode::SignalInt as i32, 130);
        assert_eq!(ExitCode::SignalTerm as i32, 143);
    }

    #[cfg(unix)]
    #[test]
    fn test_first_signal_requests_graceful_shutdown() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let _handler = SignalHandler::new(tx).unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();
        let ctrl = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(ctrl, Ctrl::Shutdown { immediate: false });
    }
}
