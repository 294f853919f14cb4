use std::fmt;
use std::sync::Arc;

/// A logging callable. Receives preformatted arguments, exactly like the
/// `log` macros do.
pub type LogFunc = Arc<dyn Fn(fmt::Arguments<'_>) + Send + Sync>;

/// Per-instance debug/error sinks. Defaults forward to the `log` facade so
/// an application's `env_logger` (or any other `log` backend) picks the
/// output up without extra wiring.
#[derive(Clone)]
pub(crate) struct Logger {
    debug: LogFunc,
    error: LogFunc,
}

impl Logger {
    pub(crate) fn debug(&self, args: fmt::Arguments<'_>) {
        (self.debug)(args)
    }

    pub(crate) fn error(&self, args: fmt::Arguments<'_>) {
        (self.error)(args)
    }

    pub(crate) fn set_debug(&mut self, f: LogFunc) {
        self.debug = f;
    }

    pub(crate) fn set_error(&mut self, f: LogFunc) {
        self.error = f;
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger {
            debug: Arc::new(|args| debug!("{args}")),
            error: Arc::new(|args| error!("{args}")),
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn custom_sinks_receive_formatted_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            Arc::new(move |args: fmt::Arguments<'_>| {
                seen.lock().unwrap().push(args.to_string());
            })
        };

        let mut logger = Logger::default();
        logger.set_debug(sink.clone());
        logger.set_error(sink);

        logger.debug(format_args!("hello {}", 1));
        logger.error(format_args!("oops {}", 2));

        assert_eq!(*seen.lock().unwrap(), vec!["hello 1", "oops 2"]);
    }
}
