use std::{
    any::Any,
    backtrace::Backtrace,
    panic::{PanicHookInfo, take_hook},
    thread,
};

/// Installs a global panic hook that logs panics via `tracing` before
/// delegating to the previously installed hook.
///
/// Panics inside tokio tasks are still caught by the runtime; the hook only
/// makes sure they reach the log files as well as stderr.
pub fn install() {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let panic_record = format_panic_record(panic_info);
            tracing::error!(target: "tcpconnect_agent::panic", "{panic_record}");
        }));

        previous_hook(panic_info);
    }));
}

fn format_panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = payload_message(panic_info.payload());
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());

    let thread_name = thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());

    let backtrace = Backtrace::capture();

    format!(
        "PANIC thread={thread_name} location={location} payload={payload}\nBacktrace:\n{backtrace}"
    )
}

/// Best-effort text of a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let static_str: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(payload_message(static_str.as_ref()), "boom");

        let owned: Box<dyn Any + Send> = Box::new(format!("pid {}", 42));
        assert_eq!(payload_message(owned.as_ref()), "pid 42");

        let other: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(payload_message(other.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_payload_from_caught_panic() {
        let payload = std::panic::catch_unwind(|| panic!("collector exploded")).unwrap_err();
        assert_eq!(payload_message(payload.as_ref()), "collector exploded");
    }
}
