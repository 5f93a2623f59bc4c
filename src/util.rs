use std::{
    os::raw::c_int,
    sync::atomic::{AtomicBool, Ordering},
    thread::sleep,
    time::Duration,
};

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Relaxed)
}

/// Turns SIGINT/SIGTERM/SIGQUIT into a stop request, honoured between
/// iterations.
pub fn setup_signal_handler() -> anyhow::Result<()> {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    std::thread::spawn(move || {
        if let Some(info) = signals.forever().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            stop_req();
        }
    });
    Ok(())
}

/// Calls `f` up to `1 + max` times, sleeping `delay` between attempts.
/// Gives up early once a stop was requested.
pub fn retry<T, E: std::fmt::Display>(
    max: u32,
    delay: Duration,
    mut f: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut tried = 0;
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) => {
                if tried < max && !stop_soon() {
                    log::warn!("attempt {} failed: {}, retrying", tried + 1, e);
                    sleep(delay);
                    tried += 1;
                } else {
                    return Err(e);
                }
            }
        }
    }
}
