//! Log sink handed in by the embedding application

use tracing::error;

/// Accepts descriptive failure messages from lifecycle operations.
///
/// Implementations must be `Send + Sync`; closures of `Fn(&str)` qualify.
pub trait LogSink: Send + Sync {
    fn log_input(&self, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log_input(&self, message: &str) {
        self(message)
    }
}

/// Sink that forwards to `tracing` at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log_input(&self, message: &str) {
        error!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_sink() {
        let lines = Mutex::new(Vec::new());
        let sink = |m: &str| lines.lock().push(m.to_string());
        sink.log_input("hello");
        TracingSink.log_input("ignored by the closure");
        assert_eq!(lines.lock().as_slice(), ["hello".to_string()]);
    }
}
