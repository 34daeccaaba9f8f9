/// Logs through a [`RequestLogger`](crate::RequestLogger), recording the
/// calling file, line and module path.
///
/// The message is formatted only if the severity passes the logger's level.
/// Evaluates to `true` when an entry was written.
///
/// ```no_run
/// # fn handle(logger: &mut gcplog_rs::RequestLogger) {
/// gcplog_rs::log!(logger, gcplog_rs::Severity::Critical, "hello log!!");
/// gcplog_rs::info!(logger, "user {} signed in", 42);
/// # }
/// ```
#[macro_export]
macro_rules! log {
    ($logger:expr, $severity:expr, $($arg:tt)+) => {
        $logger.log_at(
            $severity,
            || {
                $crate::SourceLocation::new(
                    ::std::file!(),
                    ::std::line!(),
                    ::std::module_path!(),
                )
            },
            || $crate::Payload::Text(::std::format!($($arg)+)),
        )
    };
}

#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Severity::Debug, $($arg)+)
    };
}

#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Severity::Info, $($arg)+)
    };
}

#[macro_export]
macro_rules! warn {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Severity::Warning, $($arg)+)
    };
}

#[macro_export]
macro_rules! error {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Severity::Error, $($arg)+)
    };
}
