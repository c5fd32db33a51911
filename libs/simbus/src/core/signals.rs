//! Interrupt handling.
//!
//! SIGINT and SIGTERM set a global flag that the task polls at every
//! synchronisation-step boundary; in-flight element steps run to
//! completion.

use std::sync::LazyLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

static INTERRUPTED: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the SIGINT/SIGTERM handlers once.
pub fn install_signal_handlers() -> std::io::Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        warn!("signal handlers already installed, skipping");
        return Ok(());
    }

    #[cfg(unix)]
    {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::flag;

        flag::register(SIGINT, Arc::clone(&INTERRUPTED))?;
        flag::register(SIGTERM, Arc::clone(&INTERRUPTED))?;
        tracing::debug!("signal handlers installed (SIGINT, SIGTERM)");
    }

    Ok(())
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Test hook; real runs never clear the flag.
#[doc(hidden)]
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_twice_is_ok() {
        assert!(install_signal_handlers().is_ok());
        assert!(install_signal_handlers().is_ok());
    }

    #[test]
    fn test_flag_roundtrip() {
        reset_interrupted();
        assert!(!is_interrupted());
        INTERRUPTED.store(true, Ordering::Relaxed);
        assert!(is_interrupted());
        reset_interrupted();
    }
}
