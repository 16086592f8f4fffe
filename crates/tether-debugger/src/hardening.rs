use std::panic::PanicHookInfo;
use std::sync::{Arc, Once};

use tether_config::{init_tracing, TetherConfig};

pub type PanicNotifier = Arc<dyn Fn(&str) + Send + Sync + 'static>;

static PANIC_HOOK: Once = Once::new();

/// Initialize structured logging and install a process-wide panic hook.
///
/// The hook records the panic through `tracing` and hands a one-line summary
/// to `notifier`. Only the first call installs it.
pub fn init(config: &TetherConfig, notifier: PanicNotifier) {
    init_tracing(&config.logging);
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if cfg!(debug_assertions) {
                previous(info);
            }
            let message = panic_message(info);
            let location = info
                .location()
                .map(|location| location.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            tracing::error!(target: "tether.debugger", %location, %message, "panic");
            notifier(&format!("tether-debugger panicked at {location}: {message}"));
        }));
    });
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
